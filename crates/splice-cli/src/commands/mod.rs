pub mod assemble;
pub mod check_map;
