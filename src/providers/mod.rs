//! Vendor adapters implementing [`Provider`][crate::Provider].

mod flagd;
pub mod flagsmith;
pub mod growthbook;

pub use flagd::FlagdProvider;
pub use flagsmith::FlagsmithProvider;
pub use growthbook::GrowthBookProvider;
