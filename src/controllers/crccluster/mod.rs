pub mod controller;

pub use controller::run;

mod access;
mod conditions;
mod reconcilers;
#[cfg(test)]
pub(crate) mod test_support;
