pub mod file_util;
pub mod signature;
pub mod test_utils;
