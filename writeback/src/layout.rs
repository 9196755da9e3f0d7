//! Map between backing objects and image (file) byte ranges.
//!
//! An image is striped across fixed-size backing objects. Consecutive stripe units of the image
//! are placed round-robin on `stripe_count` objects (an "object set"); once every object in the
//! set is full the next set begins.

use crate::Error;

/// An image byte range: `(offset, length)`.
pub type Extent = (u64, u64);

/// Striping parameters of an image.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Layout {
    object_size: u64,
    stripe_unit: u64,
    stripe_count: u64,
}

impl Layout {
    /// Create a layout, validating that every object holds a whole number of stripe units.
    pub fn new(object_size: u64, stripe_unit: u64, stripe_count: u64) -> Result<Self, Error> {
        if stripe_unit == 0 {
            return Err(Error::InvalidLayout("stripe unit must be non-zero"));
        }
        if stripe_count == 0 {
            return Err(Error::InvalidLayout("stripe count must be non-zero"));
        }
        if object_size < stripe_unit {
            return Err(Error::InvalidLayout(
                "object size must be at least the stripe unit",
            ));
        }
        if object_size % stripe_unit != 0 {
            return Err(Error::InvalidLayout(
                "object size must be a multiple of the stripe unit",
            ));
        }
        Ok(Self {
            object_size,
            stripe_unit,
            stripe_count,
        })
    }

    /// A layout without striping: each object holds one contiguous range of the image.
    pub fn unstriped(object_size: u64) -> Result<Self, Error> {
        Self::new(object_size, object_size, 1)
    }

    pub fn object_size(&self) -> u64 {
        self.object_size
    }

    /// Map `length` bytes at `offset` within object `object_no` onto image extents.
    ///
    /// One extent is produced per stripe unit touched, in object order. Adjacent extents are
    /// not merged. Fails if the range extends past the end of the object or if an extent
    /// would not be addressable within the image.
    pub fn extent_to_file(
        &self,
        object_no: u64,
        offset: u64,
        length: u64,
    ) -> Result<Vec<Extent>, Error> {
        let out_of_range = || Error::OutOfRange(object_no, offset, length);
        match offset.checked_add(length) {
            Some(end) if end <= self.object_size => {}
            _ => return Err(out_of_range()),
        }

        let su = self.stripe_unit;
        let stripes_per_object = self.object_size / su;
        let stripe_pos = object_no % self.stripe_count;
        let object_set = object_no / self.stripe_count;

        let mut extents = Vec::with_capacity((length / su + 1) as usize);
        let mut pos = offset;
        let mut remaining = length;
        let mut offset_in_block = offset % su;
        while remaining > 0 {
            let extent_length = remaining.min(su - offset_in_block);
            let extent_offset = object_set
                .checked_mul(stripes_per_object)
                .and_then(|first| first.checked_add(pos / su))
                .and_then(|stripe_no| stripe_no.checked_mul(self.stripe_count))
                .and_then(|block_no| block_no.checked_add(stripe_pos))
                .and_then(|block_no| block_no.checked_mul(su))
                .and_then(|start| start.checked_add(offset_in_block))
                .filter(|start| start.checked_add(extent_length).is_some())
                .ok_or_else(out_of_range)?;
            extents.push((extent_offset, extent_length));

            offset_in_block = 0;
            pos += extent_length;
            remaining -= extent_length;
        }
        Ok(extents)
    }
}

/// Name of object `object_no` of the image whose objects carry `prefix`.
pub fn object_name(prefix: &str, object_no: u64) -> String {
    format!("{prefix}.{object_no:016x}")
}

/// Recover the object number from an object name produced by [object_name].
pub fn object_no(prefix: &str, oid: &str) -> Result<u64, Error> {
    let invalid = || Error::InvalidObjectName(oid.to_string());
    let suffix = oid
        .strip_prefix(prefix)
        .and_then(|rest| rest.strip_prefix('.'))
        .ok_or_else(invalid)?;
    if suffix.is_empty() {
        return Err(invalid());
    }
    u64::from_str_radix(suffix, 16).map_err(|_| invalid())
}

/// Trim `extents` (sorted by image offset) to the first `overlap` bytes of the image and
/// return the number of bytes that remain.
pub fn prune_parent_extents(extents: &mut Vec<Extent>, overlap: u64) -> u64 {
    // Drop extents entirely beyond the overlap
    while extents.last().is_some_and(|&(offset, _)| offset >= overlap) {
        extents.pop();
    }

    // Trim the final extent
    if let Some((offset, length)) = extents.last_mut() {
        if *offset + *length > overlap {
            *length = overlap - *offset;
        }
    }
    extents.iter().map(|&(_, length)| length).sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    const MIB: u64 = 1024 * 1024;
    const KIB: u64 = 1024;

    #[test]
    fn test_layout_validation() {
        assert!(Layout::new(4 * MIB, 0, 1).is_err());
        assert!(Layout::new(4 * MIB, 4 * MIB, 0).is_err());
        assert!(Layout::new(64 * KIB, 4 * MIB, 1).is_err());
        assert!(Layout::new(100 * KIB, 64 * KIB, 2).is_err());
        assert!(Layout::new(256 * KIB, 64 * KIB, 4).is_ok());
    }

    #[test]
    fn test_unstriped_extent() {
        let layout = Layout::unstriped(4 * MIB).unwrap();
        assert_eq!(layout.extent_to_file(3, 10, 20).unwrap(), vec![(3 * 4 * MIB + 10, 20)]);
        assert_eq!(layout.extent_to_file(0, 0, 4 * MIB).unwrap(), vec![(0, 4 * MIB)]);
        assert!(layout.extent_to_file(7, 100, 0).unwrap().is_empty());
    }

    #[test]
    fn test_striped_extents() {
        let layout = Layout::new(256 * KIB, 64 * KIB, 4).unwrap();

        // Object 5 is the second object of the second object set
        let extents = layout.extent_to_file(5, 0, 128 * KIB).unwrap();
        assert_eq!(extents, vec![(17 * 64 * KIB, 64 * KIB), (21 * 64 * KIB, 64 * KIB)]);

        // A range starting mid-unit is split at the stripe unit boundary
        let extents = layout.extent_to_file(0, 60 * KIB, 8 * KIB).unwrap();
        assert_eq!(extents, vec![(60 * KIB, 4 * KIB), (4 * 64 * KIB, 4 * KIB)]);
    }

    #[test]
    fn test_unmerged_extents_within_one_object() {
        let layout = Layout::new(256 * KIB, 64 * KIB, 1).unwrap();
        let extents = layout.extent_to_file(1, 0, 256 * KIB).unwrap();
        assert_eq!(extents.len(), 4);
        assert_eq!(extents[0], (256 * KIB, 64 * KIB));
        assert_eq!(extents[3], (448 * KIB, 64 * KIB));
    }

    #[test]
    fn test_out_of_range_extents() {
        let layout = Layout::unstriped(4 * MIB).unwrap();

        // Past the end of the object
        assert!(matches!(
            layout.extent_to_file(0, 4 * MIB - 10, 11),
            Err(Error::OutOfRange(0, _, 11))
        ));
        assert!(matches!(
            layout.extent_to_file(0, u64::MAX - 10, 100),
            Err(Error::OutOfRange(..))
        ));

        // Objects whose image offset does not fit in a u64
        assert!(matches!(
            layout.extent_to_file(1 << 42, 0, 1),
            Err(Error::OutOfRange(..))
        ));
        assert_eq!(
            layout.extent_to_file((1 << 42) - 1, 4 * MIB - 2, 1).unwrap(),
            vec![(u64::MAX - 1, 1)]
        );

        let layout = Layout::new(256 * KIB, 64 * KIB, 4).unwrap();
        assert!(matches!(
            layout.extent_to_file(u64::MAX, 0, 1),
            Err(Error::OutOfRange(..))
        ));
    }

    #[test]
    fn test_object_names() {
        let name = object_name("rbd_data.1234", 0x2a);
        assert_eq!(name, "rbd_data.1234.000000000000002a");
        assert_eq!(object_no("rbd_data.1234", &name).unwrap(), 0x2a);

        assert!(matches!(
            object_no("rbd_data.1234", "rbd_data.9999.0000000000000001"),
            Err(Error::InvalidObjectName(_))
        ));
        assert!(object_no("rbd_data.1234", "rbd_data.1234.").is_err());
        assert!(object_no("rbd_data.1234", "rbd_data.1234.zz").is_err());
        assert!(object_no("rbd_data.1234", "rbd_data.1234").is_err());
    }

    #[test]
    fn test_prune_parent_extents() {
        let mut extents = vec![(0, 100), (100, 100), (300, 50)];
        assert_eq!(prune_parent_extents(&mut extents, 150), 150);
        assert_eq!(extents, vec![(0, 100), (100, 50)]);

        let mut extents = vec![(400, 100)];
        assert_eq!(prune_parent_extents(&mut extents, 400), 0);
        assert!(extents.is_empty());

        let mut extents = vec![(0, 100), (200, 100)];
        assert_eq!(prune_parent_extents(&mut extents, 1000), 200);

        let mut extents = Vec::new();
        assert_eq!(prune_parent_extents(&mut extents, 1000), 0);
    }
}
