pub mod lazy;
#[cfg(unix)]
pub mod quiesce;
