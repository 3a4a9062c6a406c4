// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Error types for MemFS Core

use std::io;

/// Core filesystem error type
#[derive(thiserror::Error, Debug)]
pub enum FsError {
    #[error("not found")]
    NotFound,
    #[error("already exists")]
    AlreadyExists,
    #[error("node limit reached")]
    OutOfNodes,
    #[error("mount page quota exhausted")]
    OutOfQuota,
    #[error("system memory reserve would be breached")]
    OutOfMemory,
    #[error("busy")]
    Busy,
    #[error("read-only filesystem")]
    ReadOnly,
    #[error("invalid argument")]
    InvalidArgument,
    #[error("name not allowed")]
    InvalidName,
    #[error("name too long")]
    NameTooLong,
    #[error("not a directory")]
    NotADirectory,
    #[error("is a directory")]
    IsADirectory,
    #[error("directory not empty")]
    NotEmpty,
    #[error("operation not permitted")]
    NotPermitted,
    #[error("file too large")]
    FileTooLarge,
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl FsError {
    /// errno value the VFS dispatch layer reports for this error.
    pub fn errno(&self) -> i32 {
        match self {
            FsError::NotFound => libc::ENOENT,
            FsError::AlreadyExists => libc::EEXIST,
            FsError::OutOfNodes | FsError::OutOfQuota | FsError::OutOfMemory => libc::ENOSPC,
            FsError::Busy => libc::EBUSY,
            FsError::ReadOnly => libc::EROFS,
            FsError::InvalidArgument | FsError::InvalidName => libc::EINVAL,
            FsError::NameTooLong => libc::ENAMETOOLONG,
            FsError::NotADirectory => libc::ENOTDIR,
            FsError::IsADirectory => libc::EISDIR,
            FsError::NotEmpty => libc::ENOTEMPTY,
            FsError::NotPermitted => libc::EPERM,
            FsError::FileTooLarge => libc::EFBIG,
            FsError::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
        }
    }
}

pub type FsResult<T> = Result<T, FsError>;
