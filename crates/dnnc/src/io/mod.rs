pub mod param_file;

pub use param_file::{load_params, read_params, save_params, write_params};
