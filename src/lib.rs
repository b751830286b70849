pub mod ir;
pub mod optimizer;
pub mod pattern;
