pub mod work_set;

pub use work_set::{StaticWorkSet, WorkSetEnumerator};
