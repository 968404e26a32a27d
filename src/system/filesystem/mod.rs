pub mod devfs;
pub mod paths;

use core::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FSError {
    InvalidOperation,
    NotFound,
    AlreadyExist,
    IllegalPath,
    ReadOnly,
}

impl fmt::Display for FSError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            FSError::InvalidOperation => write!(f, "invalid operation"),
            FSError::NotFound => write!(f, "no such file"),
            FSError::AlreadyExist => write!(f, "file exists"),
            FSError::IllegalPath => write!(f, "illegal path"),
            FSError::ReadOnly => write!(f, "read-only file"),
        }
    }
}
