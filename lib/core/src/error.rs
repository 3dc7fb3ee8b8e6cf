//! Error handling foundation for the erp-flow crates.
//!
//! Each crate defines its own layered error enums. Public entry points return
//! them wrapped in a rootcause `Report` so callers can attach context while
//! still matching on the typed error through `Report::current_context`.

use rootcause::Report;

/// A Result type alias using rootcause's Report for error handling.
pub type Result<T, C = ()> = std::result::Result<T, Report<C>>;
