//! Runtime plumbing shared by the async surfaces.

pub mod worker;
