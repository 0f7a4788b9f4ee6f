
/// Something (usually addresses or sizes) that is alignable to a certain alignment
/// represented in the same type and usually a power of two.
pub trait Alignable: Sized {
    type Alignment;

    /// Return the smallest `x` that is a multiple of `alignment` such that `x >= num`.
    fn align_up(self, alignment: Self::Alignment) -> Self;

    /// Return the largest `x` that is a multiple of `alignment` such that `x <= num`.
    fn align_down(self, alignment: Self::Alignment) -> Self;
}

/// Check for alignment of plain integers, e.g. register offsets.
pub trait IsAligned {
    fn is_aligned(self, alignment: Self) -> bool;
}

macro_rules! impl_alignable {
    ($num:ty) => {
        impl Alignable for $num {
            type Alignment = $num;

            fn align_up(self, alignment: $num) -> $num {
                if alignment == 0 {
                    return self;
                }
                let mask = alignment - 1;
                assert!(alignment & mask == 0, "alignment must be power of two");
                (self + mask) & !mask
            }

            fn align_down(self, alignment: $num) -> $num {
                if alignment == 0 {
                    return self;
                }
                let mask = alignment - 1;
                assert!(alignment & mask == 0, "alignment must be power of two");
                self & !mask
            }
        }

        impl IsAligned for $num {
            fn is_aligned(self, alignment: $num) -> bool {
                self.align_down(alignment) == self
            }
        }
    };
}

impl_alignable!(usize);
impl_alignable!(u64);
impl_alignable!(u32);
