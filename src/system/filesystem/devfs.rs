extern crate alloc;
extern crate log;
extern crate spin;

use crate::system::filesystem::{paths, FSError};
use alloc::{boxed::Box, string::String, vec::Vec};

use lazy_static::lazy_static;
use spin::{Mutex, MutexGuard};

/// A device node. Reads are positional, the node keeps no cursor.
pub trait DevOps {
    fn length(&self) -> usize;
    fn read(&self, offset: usize, buffer: &mut [u8]) -> Result<usize, FSError>;
    fn write(&self, _offset: usize, _buffer: &[u8]) -> Result<usize, FSError> {
        Err(FSError::ReadOnly)
    }
}

pub struct DevFSEntry {
    pub name: String,
    pub major: u32,
    pub minor: u32,
    pub device: Box<dyn DevOps + Sync + Send>,
    pub ref_count: usize,
}

lazy_static! {
    pub static ref DEV_FS: Mutex<Vec<DevFSEntry>> = Mutex::new(Vec::new());
}

#[derive(Debug, Clone)]
pub struct DevFSDescriptor {
    pub flags: u32,
    pub major: u32,
    pub minor: u32,
}

#[inline]
fn get_dev_index(
    locked_dev: &MutexGuard<Vec<DevFSEntry>>,
    major: u32,
    minor: u32,
) -> Option<usize> {
    locked_dev
        .iter()
        .position(|device| device.major == major && device.minor == minor)
}

/// Adds a device node at `path`. Both the path and the major/minor pair
/// have to be unused.
pub fn register_device(
    path: &str,
    major: u32,
    minor: u32,
    device: Box<dyn DevOps + Sync + Send>,
) -> Result<(), FSError> {
    let name = paths::resolve(path)?;

    let mut devfs_lock = DEV_FS.lock();
    if get_dev_index(&devfs_lock, major, minor).is_some()
        || devfs_lock.iter().any(|entry| entry.name == name)
    {
        return Err(FSError::AlreadyExist);
    }

    log::debug!("devfs: {} registered as {}:{}", name, major, minor);
    devfs_lock.push(DevFSEntry {
        name,
        major,
        minor,
        device,
        ref_count: 0,
    });
    Ok(())
}

pub fn open(path: &str, flags: u32) -> Result<DevFSDescriptor, FSError> {
    let name = paths::resolve(path)?;

    let mut devfs_lock = DEV_FS.lock();
    let entry = devfs_lock
        .iter_mut()
        .find(|entry| entry.name == name)
        .ok_or(FSError::NotFound)?;

    entry.ref_count += 1;
    Ok(DevFSDescriptor {
        flags,
        major: entry.major,
        minor: entry.minor,
    })
}

pub fn close(fd: &DevFSDescriptor) -> Result<(), FSError> {
    let mut devfs_lock = DEV_FS.lock();
    let dev_index = get_dev_index(&devfs_lock, fd.major, fd.minor).ok_or(FSError::NotFound)?;
    let entry = &mut devfs_lock[dev_index];
    if entry.ref_count > 0 {
        entry.ref_count -= 1;
    }
    Ok(())
}

pub fn read(fd: &DevFSDescriptor, offset: usize, buffer: &mut [u8]) -> Result<usize, FSError> {
    let devfs_lock = DEV_FS.lock();
    let dev_index = get_dev_index(&devfs_lock, fd.major, fd.minor).ok_or(FSError::NotFound)?;
    devfs_lock[dev_index].device.read(offset, buffer)
}

pub fn write(fd: &DevFSDescriptor, offset: usize, buffer: &[u8]) -> Result<usize, FSError> {
    let devfs_lock = DEV_FS.lock();
    let dev_index = get_dev_index(&devfs_lock, fd.major, fd.minor).ok_or(FSError::NotFound)?;
    devfs_lock[dev_index].device.write(offset, buffer)
}

pub fn length(fd: &DevFSDescriptor) -> Result<usize, FSError> {
    let devfs_lock = DEV_FS.lock();
    let dev_index = get_dev_index(&devfs_lock, fd.major, fd.minor).ok_or(FSError::NotFound)?;
    Ok(devfs_lock[dev_index].device.length())
}

/// Reads a whole node into a string.
pub fn read_to_string(path: &str) -> Result<String, FSError> {
    let fd = open(path, 0)?;
    let mut buffer = alloc::vec![0u8; length(&fd)?];
    let result = read(&fd, 0, &mut buffer);
    close(&fd)?;

    let count = result?;
    buffer.truncate(count);
    String::from_utf8(buffer).map_err(|_| FSError::InvalidOperation)
}

pub fn ref_count(path: &str) -> Option<usize> {
    let name = paths::resolve(path).ok()?;
    DEV_FS
        .lock()
        .iter()
        .find(|entry| entry.name == name)
        .map(|entry| entry.ref_count)
}
