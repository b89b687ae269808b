/// For narrowing casts where protocol logic ensures that the value is in the narrower type's
///  range, e.g. payload lengths that were checked against the configured maximum.
/// NB: The implementations panic otherwise
pub trait PrecheckedCast<T> {
    fn prechecked_cast(self) -> T;
}
impl PrecheckedCast<u32> for usize {
    fn prechecked_cast(self) -> u32 {
        self.try_into().expect("this is a bug: application logic should have ensured the value range")
    }
}
impl PrecheckedCast<u16> for u32 {
    fn prechecked_cast(self) -> u16 {
        self.try_into().expect("this is a bug: application logic should have ensured the value range")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prechecked_cast_in_range() {
        let len: u32 = 1234usize.prechecked_cast();
        assert_eq!(len, 1234);
        let minutes: u16 = 0xfffu32.prechecked_cast();
        assert_eq!(minutes, 0xfff);
    }

    #[test]
    #[should_panic]
    fn test_prechecked_cast_out_of_range() {
        let _: u16 = 0x1_0000u32.prechecked_cast();
    }
}
