pub mod chain;
pub mod policy;

pub use chain::MergedPolicyChain;
pub use policy::{Next, Policy};
