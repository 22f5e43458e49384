/// Priority of a load request. Higher values are scheduled first. Priority
/// only affects which ready work is chosen next, never correctness.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LoadPriority(pub u32);

impl LoadPriority {
    pub const NORMAL: LoadPriority = LoadPriority(0);
    pub const HIGH: LoadPriority = LoadPriority(100);

    pub fn max(
        self,
        other: LoadPriority,
    ) -> LoadPriority {
        if other.0 > self.0 {
            other
        } else {
            self
        }
    }
}
