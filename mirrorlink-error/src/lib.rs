// Copyright 2024 The Mirrorlink Authors. All rights reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//    http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use serde::{Deserialize, Serialize};

#[macro_export]
macro_rules! make_err {
    ($code:expr, $($arg:tt)+) => {{
        $crate::Error::new(
            $code,
            format!("{}", format_args!($($arg)+)),
        )
    }};
}

#[macro_export]
macro_rules! make_input_err {
    ($($arg:tt)+) => {{
        $crate::make_err!($crate::Code::InvalidArgument, $($arg)+)
    }};
}

#[macro_export]
macro_rules! error_if {
    ($cond:expr, $($arg:tt)+) => {{
        if $cond {
            Err($crate::make_err!($crate::Code::InvalidArgument, $($arg)+))?;
        }
    }};
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Error {
    pub code: Code,
    pub messages: Vec<String>,
}

impl Error {
    pub fn new(code: Code, msg: String) -> Self {
        let mut msgs = Vec::with_capacity(1);
        if !msg.is_empty() {
            msgs.push(msg);
        }
        Self {
            code,
            messages: msgs,
        }
    }

    #[must_use]
    pub fn merge<E: Into<Self>>(mut self, other: E) -> Self {
        let mut other: Self = other.into();
        // This will help with knowing which messages are tied to different errors.
        self.messages.push("---".to_string());
        self.messages.append(&mut other.messages);
        self
    }

    #[must_use]
    pub fn append<S: Into<String>>(mut self, msg: S) -> Self {
        self.messages.push(msg.into());
        self
    }

    pub fn code(&self) -> Code {
        self.code
    }

    pub fn message_string(&self) -> String {
        self.messages.join(" : ")
    }
}

impl std::error::Error for Error {}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        // A manual impl to avoid the verbosity of the derived Debug for Code.
        let mut builder = f.debug_struct("Error");
        builder.field("code", &self.code);
        builder.field("messages", &self.messages);
        builder.finish()
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self {
            code: err.kind().into(),
            messages: vec![err.to_string()],
        }
    }
}

impl From<redis::RedisError> for Error {
    fn from(err: redis::RedisError) -> Self {
        let code = if err.is_connection_refusal() || err.is_connection_dropped() || err.is_timeout()
        {
            Code::Unavailable
        } else {
            Code::Internal
        };
        make_err!(code, "{err}")
    }
}

impl From<hyper::Error> for Error {
    fn from(err: hyper::Error) -> Self {
        let code = if err.is_timeout() {
            Code::DeadlineExceeded
        } else if err.is_connect() || err.is_closed() || err.is_incomplete_message() {
            Code::Unavailable
        } else {
            Code::Internal
        };
        make_err!(code, "{err}")
    }
}

impl From<hyper::http::Error> for Error {
    fn from(err: hyper::http::Error) -> Self {
        make_err!(Code::Internal, "{err}")
    }
}

impl From<hyper::http::uri::InvalidUri> for Error {
    fn from(err: hyper::http::uri::InvalidUri) -> Self {
        make_err!(Code::InvalidArgument, "{err}")
    }
}

impl From<std::num::ParseIntError> for Error {
    fn from(err: std::num::ParseIntError) -> Self {
        make_err!(Code::InvalidArgument, "{err}")
    }
}

impl From<std::num::ParseFloatError> for Error {
    fn from(err: std::num::ParseFloatError) -> Self {
        make_err!(Code::InvalidArgument, "{err}")
    }
}

impl From<std::time::SystemTimeError> for Error {
    fn from(err: std::time::SystemTimeError) -> Self {
        make_err!(Code::OutOfRange, "{err}")
    }
}

impl From<Code> for Error {
    fn from(code: Code) -> Self {
        Self {
            code,
            messages: vec![],
        }
    }
}

impl From<std::io::ErrorKind> for Code {
    fn from(kind: std::io::ErrorKind) -> Self {
        match kind {
            std::io::ErrorKind::NotFound => Code::NotFound,
            std::io::ErrorKind::PermissionDenied => Code::PermissionDenied,
            std::io::ErrorKind::ConnectionRefused
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::NotConnected => Code::Unavailable,
            std::io::ErrorKind::AlreadyExists => Code::AlreadyExists,
            std::io::ErrorKind::InvalidInput | std::io::ErrorKind::InvalidData => {
                Code::InvalidArgument
            }
            std::io::ErrorKind::TimedOut => Code::DeadlineExceeded,
            std::io::ErrorKind::Interrupted => Code::Aborted,
            std::io::ErrorKind::UnexpectedEof | std::io::ErrorKind::BrokenPipe => Code::Internal,
            _ => Code::Unknown,
        }
    }
}

pub trait ResultExt<T> {
    fn err_tip_with_code<F, S>(self, tip_fn: F) -> Result<T, Error>
    where
        Self: Sized,
        S: Into<String>,
        F: (FnOnce(&Error) -> (Code, S)) + Sized;

    fn err_tip<F, S>(self, tip_fn: F) -> Result<T, Error>
    where
        Self: Sized,
        S: Into<String>,
        F: (FnOnce() -> S) + Sized,
    {
        self.err_tip_with_code(|e| (e.code, tip_fn()))
    }

    fn merge<U>(self, _other: Result<U, Error>) -> Result<U, Error>
    where
        Self: Sized,
    {
        unreachable!();
    }
}

impl<T, E: Into<Error>> ResultExt<T> for Result<T, E> {
    fn err_tip_with_code<F, S>(self, tip_fn: F) -> Result<T, Error>
    where
        Self: Sized,
        S: Into<String>,
        F: (FnOnce(&Error) -> (Code, S)) + Sized,
    {
        self.map_err(|e| {
            let mut error: Error = e.into();
            let (code, message) = tip_fn(&error);
            error.code = code;
            error.messages.push(message.into());
            error
        })
    }

    fn merge<U>(self, other: Result<U, Error>) -> Result<U, Error>
    where
        Self: Sized,
    {
        // Ignore the success value of self, but always surface its error.
        if let Err(e) = self {
            let mut e: Error = e.into();
            if let Err(other_err) = other {
                e = e.merge(other_err);
            }
            return Err(e);
        }
        other
    }
}

impl<T> ResultExt<T> for Option<T> {
    fn err_tip_with_code<F, S>(self, tip_fn: F) -> Result<T, Error>
    where
        Self: Sized,
        S: Into<String>,
        F: (FnOnce(&Error) -> (Code, S)) + Sized,
    {
        self.ok_or_else(|| {
            let mut error = Error {
                code: Code::Internal,
                messages: vec![],
            };
            let (code, message) = tip_fn(&error);
            error.code = code;
            error.messages.push(message.into());
            error
        })
    }
}

/// Error codes, loosely modelled on the canonical RPC codes so every
/// subsystem can agree on retryability without inspecting messages.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Code {
    Ok = 0,
    Cancelled = 1,
    Unknown = 2,
    InvalidArgument = 3,
    DeadlineExceeded = 4,
    NotFound = 5,
    AlreadyExists = 6,
    PermissionDenied = 7,
    ResourceExhausted = 8,
    FailedPrecondition = 9,
    Aborted = 10,
    OutOfRange = 11,
    Unimplemented = 12,
    Internal = 13,
    Unavailable = 14,
    DataLoss = 15,
    Unauthenticated = 16,
}

impl Code {
    /// True when a retry at a later time could reasonably succeed.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            Code::Unavailable | Code::ResourceExhausted | Code::DeadlineExceeded
        )
    }
}

#[cfg(test)]
mod error_tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn display_matches_debug_struct_form() {
        let err = make_err!(Code::Unavailable, "Dummy failure");
        assert_eq!(
            err.to_string(),
            "Error { code: Unavailable, messages: [\"Dummy failure\"] }"
        );
    }

    #[test]
    fn err_tip_appends_message_and_keeps_code() {
        let res: Result<(), Error> = Err(make_err!(Code::NotFound, "missing"));
        let err = res.err_tip(|| "While loading mirror").unwrap_err();
        assert_eq!(err.code, Code::NotFound);
        assert_eq!(err.messages, vec!["missing", "While loading mirror"]);
    }

    #[test]
    fn option_err_tip_with_code() {
        let value: Option<u32> = None;
        let err = value
            .err_tip_with_code(|_| (Code::NotFound, "no such id"))
            .unwrap_err();
        assert_eq!(err.code, Code::NotFound);
    }

    #[test]
    fn merge_prefers_first_error() {
        let a: Result<(), Error> = Err(make_err!(Code::Internal, "first"));
        let b: Result<u32, Error> = Err(make_err!(Code::Unavailable, "second"));
        let err = a.merge(b).unwrap_err();
        assert_eq!(err.code, Code::Internal);
        assert_eq!(err.messages, vec!["first", "---", "second"]);
    }
}
