/// Identifies one load request made by the caller. Allocated from a monotonic
/// counter starting at 1.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct RequestId(pub u64);
