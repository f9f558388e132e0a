// Licensed to the Apache Software Foundation (ASF) under one
// or more contributor license agreements.  See the NOTICE file
// distributed with this work for additional information
// regarding copyright ownership.  The ASF licenses this file
// to you under the Apache License, Version 2.0 (the
// "License"); you may not use this file except in compliance
// with the License.  You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing,
// software distributed under the License is distributed on an
// "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied.  See the License for the
// specific language governing permissions and limitations
// under the License.

//! Error handling for Granite.
//!
//! Two broad classes of errors exist:
//!
//! 1. Expected errors, raised by invalid input or exhausted resources
//!    ([`QueryError::Execution`], [`QueryError::ResourcesExhausted`], ...).
//!    `ResourcesExhausted` is special: it is the only error an operator may
//!    recover from by spilling a partition and retrying.
//!
//! 2. Unexpected errors ([`QueryError::Internal`]), which indicate a broken
//!    internal invariant and therefore a bug.

use std::error::Error;
use std::fmt::{Display, Formatter};
use std::io;
use std::result;

/// Result type for operations that could result in a [QueryError]
pub type Result<T, E = QueryError> = result::Result<T, E>;

/// Granite error
#[derive(Debug)]
pub enum QueryError {
    /// Error due to a broken invariant. This should not happen in normal
    /// usage and indicates a bug.
    Internal(String),
    /// Error during execution of the query, caused by malformed input.
    Execution(String),
    /// Error for invalid or unsupported configuration options.
    Configuration(String),
    /// Error when memory or scratch disk space is exhausted. Recoverable by
    /// spilling as long as a spillable partition remains.
    ResourcesExhausted(String),
    /// Error when an I/O operation fails (e.g. on a spill file).
    IoError(io::Error),
    /// The query was cancelled by the caller.
    Cancelled,
}

impl Display for QueryError {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        match self {
            QueryError::Internal(desc) => {
                write!(f, "Internal error: {desc}. This was likely caused by a bug in Granite's code and we would welcome that you file an bug report in our issue tracker")
            }
            QueryError::Execution(desc) => write!(f, "Execution error: {desc}"),
            QueryError::Configuration(desc) => {
                write!(f, "Invalid or Unsupported Configuration: {desc}")
            }
            QueryError::ResourcesExhausted(desc) => {
                write!(f, "Resources exhausted: {desc}")
            }
            QueryError::IoError(desc) => write!(f, "IO error: {desc}"),
            QueryError::Cancelled => write!(f, "Execution error: query cancelled"),
        }
    }
}

impl Error for QueryError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            QueryError::IoError(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for QueryError {
    fn from(e: io::Error) -> Self {
        QueryError::IoError(e)
    }
}

impl QueryError {
    /// Get a short descriptive name of the error variant, mostly for logging.
    pub fn variant_name(&self) -> &'static str {
        match self {
            QueryError::Internal(_) => "Internal",
            QueryError::Execution(_) => "Execution",
            QueryError::Configuration(_) => "Configuration",
            QueryError::ResourcesExhausted(_) => "ResourcesExhausted",
            QueryError::IoError(_) => "IoError",
            QueryError::Cancelled => "Cancelled",
        }
    }

    /// True iff the error may be recovered from by freeing memory
    /// (i.e. by spilling a partition) and retrying.
    pub fn is_mem_limit(&self) -> bool {
        matches!(self, QueryError::ResourcesExhausted(_))
    }
}

impl QueryError {
    /// Wrap the error message with additional context.
    pub fn context(self, detail: impl Into<String>) -> Self {
        let detail = detail.into();
        match self {
            QueryError::Internal(msg) => QueryError::Internal(format!("{detail}: {msg}")),
            QueryError::Execution(msg) => {
                QueryError::Execution(format!("{detail}: {msg}"))
            }
            QueryError::Configuration(msg) => {
                QueryError::Configuration(format!("{detail}: {msg}"))
            }
            QueryError::ResourcesExhausted(msg) => {
                QueryError::ResourcesExhausted(format!("{detail}: {msg}"))
            }
            other => other,
        }
    }
}

/// Constructs a `QueryError::Internal` from a format string
#[macro_export]
macro_rules! internal_granite_err {
    ($($args:expr),* $(,)?) => {
        $crate::error::QueryError::Internal(format!($($args),*))
    };
}

/// Returns `Err(QueryError::Internal(..))` from the enclosing function
#[macro_export]
macro_rules! internal_err {
    ($($args:expr),* $(,)?) => {
        Err($crate::internal_granite_err!($($args),*))
    };
}

/// Constructs a `QueryError::Execution` from a format string
#[macro_export]
macro_rules! exec_granite_err {
    ($($args:expr),* $(,)?) => {
        $crate::error::QueryError::Execution(format!($($args),*))
    };
}

/// Returns `Err(QueryError::Execution(..))` from the enclosing function
#[macro_export]
macro_rules! exec_err {
    ($($args:expr),* $(,)?) => {
        Err($crate::exec_granite_err!($($args),*))
    };
}

/// Constructs a `QueryError::Configuration` from a format string
#[macro_export]
macro_rules! config_granite_err {
    ($($args:expr),* $(,)?) => {
        $crate::error::QueryError::Configuration(format!($($args),*))
    };
}

/// Returns `Err(QueryError::Configuration(..))` from the enclosing function
#[macro_export]
macro_rules! config_err {
    ($($args:expr),* $(,)?) => {
        Err($crate::config_granite_err!($($args),*))
    };
}

/// Constructs a `QueryError::ResourcesExhausted` from a format string
#[macro_export]
macro_rules! resources_granite_err {
    ($($args:expr),* $(,)?) => {
        $crate::error::QueryError::ResourcesExhausted(format!($($args),*))
    };
}

/// Returns `Err(QueryError::ResourcesExhausted(..))` from the enclosing function
#[macro_export]
macro_rules! resources_err {
    ($($args:expr),* $(,)?) => {
        Err($crate::resources_granite_err!($($args),*))
    };
}
