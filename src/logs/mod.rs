//! Log template processing: Drain-style clustering, variable masking,
//! snapshot persistence, and periodic rebalancing.

pub mod mask;
pub mod template;

pub use template::{template_id, TemplateRecord, TemplateStore};
