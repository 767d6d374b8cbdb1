/// Widening casts that cannot lose information on any supported platform
pub trait SafeCast<T> {
    fn safe_cast(self) -> T;
}

#[cfg(any(target_pointer_width = "32", target_pointer_width = "64"))]
impl SafeCast<u64> for usize {
    fn safe_cast(self) -> u64 {
        self as u64
    }
}

#[cfg(any(target_pointer_width = "32", target_pointer_width = "64"))]
impl SafeCast<usize> for u32 {
    fn safe_cast(self) -> usize {
        self as usize
    }
}

/// For narrowing casts where business logic ensures that the value is in the narrower type's range,
///  e.g. fragment lengths that are bounded by the configured datagram size.
/// NB: The implementations will panic otherwise
pub trait PrecheckedCast<T> {
    fn prechecked_cast(self) -> T;
}
impl PrecheckedCast<u32> for usize {
    fn prechecked_cast(self) -> u32 {
        self.try_into().expect("this is a bug: application logic should have ensured the value range")
    }
}
impl PrecheckedCast<u32> for u64 {
    fn prechecked_cast(self) -> u32 {
        self.try_into().expect("this is a bug: application logic should have ensured the value range")
    }
}
impl PrecheckedCast<usize> for u64 {
    fn prechecked_cast(self) -> usize {
        self.try_into().expect("this is a bug: application logic should have ensured the value range")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_widening() {
        let len: u64 = 17usize.safe_cast();
        assert_eq!(len, 17);
        let idx: usize = u32::MAX.safe_cast();
        assert_eq!(idx as u64, u32::MAX as u64);
    }

    #[test]
    fn test_prechecked_in_range() {
        let len: u32 = 20u64.prechecked_cast();
        assert_eq!(len, 20);
        let len: u32 = (u32::MAX as u64).prechecked_cast();
        assert_eq!(len, u32::MAX);
    }

    #[test]
    #[should_panic]
    fn test_prechecked_u64_out_of_range() {
        let _: u32 = (u32::MAX as u64 + 1).prechecked_cast();
    }

    #[test]
    #[should_panic]
    fn test_prechecked_out_of_range() {
        let _: u32 = (u32::MAX as usize + 1).prechecked_cast();
    }
}
