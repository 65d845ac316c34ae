// Copyright 2024 Cloudflare, Inc.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

#![warn(clippy::all)]
//! Errors of the conduit RPC client transport.
//!
//! Every failure is a boxed [Error] carrying an [ErrorType], an optional context string and an
//! optional cause. Failures raised deep inside a pool or a connection are wrapped on their way
//! out, so the caller sees the outermost classification first and can walk [Error::chain] down to
//! the original failure.

pub use std::error::Error as ErrorTrait;
use std::fmt;
use std::result::Result as StdResult;

mod immut_str;
pub use immut_str::ImmutStr;

/// The boxed [Error], the desired way to pass [Error]
pub type BError = Box<Error>;
/// Syntax sugar for `std::Result<T, BError>`
pub type Result<T, E = BError> = StdResult<T, E>;

type Cause = Box<dyn ErrorTrait + Send + Sync>;

/// The struct that represents an error
#[derive(Debug)]
pub struct Error {
    /// the type of error
    pub etype: ErrorType,
    /// which side of the transport the error came from
    pub esource: ErrorSource,
    /// chain to the cause of this error
    pub cause: Option<Cause>,
    /// an arbitrary string that explains the context when the error happens
    pub context: Option<ImmutStr>,
}

/// The source of the error
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum ErrorSource {
    /// The destination misbehaved or could not be reached
    Remote,
    /// The pool, the dispatcher or the caller's own input
    Local,
    /// Error source unknown or to be set
    Unset,
}

impl ErrorSource {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Remote => "Remote",
            Self::Local => "Local",
            Self::Unset => "",
        }
    }
}

/// Predefined type of errors
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum ErrorType {
    // acquisition errors
    ConnectionCreationError,
    PoolExhausted,
    ShutdownInProgress,
    // connect errors
    UnresolvedDestination,
    ConnectTimedout,
    ConnectRefused,
    ConnectError,
    // exchange errors
    RequestTimedout,
    ResponseTooLarge,
    HeaderTooLarge,
    EncodingError,
    InvalidHeader,
    InvalidBody,
    ReadError,
    WriteError,
    ConnectionClosed,
    /// the uniform error a dispatched request fails with, the real failure is its cause
    RemoteInvocationError,
    // setup errors
    ConfigurationError,
    FileReadError,
    InternalError,
    /// Custom error with static string.
    /// If runtime generated text is needed, it belongs in the context rather than the type.
    Custom(&'static str),
}

impl ErrorType {
    /// Whether this kind of error means some deadline elapsed.
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            ErrorType::ConnectTimedout | ErrorType::RequestTimedout | ErrorType::PoolExhausted
        )
    }

    /// for displaying the error type
    pub fn as_str(&self) -> &str {
        match self {
            ErrorType::ConnectionCreationError => "ConnectionCreationError",
            ErrorType::PoolExhausted => "PoolExhausted",
            ErrorType::ShutdownInProgress => "ShutdownInProgress",
            ErrorType::UnresolvedDestination => "UnresolvedDestination",
            ErrorType::ConnectTimedout => "ConnectTimedout",
            ErrorType::ConnectRefused => "ConnectRefused",
            ErrorType::ConnectError => "ConnectError",
            ErrorType::RequestTimedout => "RequestTimedout",
            ErrorType::ResponseTooLarge => "ResponseTooLarge",
            ErrorType::HeaderTooLarge => "HeaderTooLarge",
            ErrorType::EncodingError => "EncodingError",
            ErrorType::InvalidHeader => "InvalidHeader",
            ErrorType::InvalidBody => "InvalidBody",
            ErrorType::ReadError => "ReadError",
            ErrorType::WriteError => "WriteError",
            ErrorType::ConnectionClosed => "ConnectionClosed",
            ErrorType::RemoteInvocationError => "RemoteInvocationError",
            ErrorType::ConfigurationError => "ConfigurationError",
            ErrorType::FileReadError => "FileReadError",
            ErrorType::InternalError => "InternalError",
            ErrorType::Custom(s) => s,
        }
    }
}

impl Error {
    /// Simply create the error. See other functions that provide less verbose interfaces.
    #[inline]
    pub fn create(
        etype: ErrorType,
        esource: ErrorSource,
        context: Option<ImmutStr>,
        cause: Option<Cause>,
    ) -> BError {
        Box::new(Error {
            etype,
            esource,
            cause,
            context,
        })
    }

    /// Create an error with the given type
    #[inline]
    pub fn new(e: ErrorType) -> BError {
        Self::create(e, ErrorSource::Unset, None, None)
    }

    /// Create an error with the given type, a context string and the causing error.
    ///
    /// The new error takes the [ErrorSource] of `cause` when `cause` is itself an [Error].
    /// ```
    /// use conduit_error::{Error, ErrorType, Result};
    ///
    /// fn connect() -> Result<()> {
    ///     Error::e_explain(ErrorType::ConnectRefused, "127.0.0.1:1")
    /// }
    /// fn acquire() -> Result<()> {
    ///     connect().map_err(|e| Error::because(ErrorType::ConnectionCreationError, "pool 127.0.0.1:1", e))
    /// }
    /// assert_eq!(
    ///     acquire().unwrap_err().root_etype(),
    ///     &ErrorType::ConnectRefused
    /// );
    /// ```
    #[inline]
    pub fn because<S: Into<ImmutStr>, E: Into<Cause>>(e: ErrorType, context: S, cause: E) -> BError {
        let cause = cause.into();
        let esource = cause
            .downcast_ref::<BError>()
            .map_or(ErrorSource::Unset, |c| c.esource);
        Self::create(e, esource, Some(context.into()), Some(cause))
    }

    /// Short for Err(Self::because)
    #[inline]
    pub fn e_because<T, S: Into<ImmutStr>, E: Into<Cause>>(
        e: ErrorType,
        context: S,
        cause: E,
    ) -> Result<T> {
        Err(Self::because(e, context, cause))
    }

    /// Create an error with context but no direct causing error
    #[inline]
    pub fn explain<S: Into<ImmutStr>>(e: ErrorType, context: S) -> BError {
        Self::create(e, ErrorSource::Unset, Some(context.into()), None)
    }

    /// Short for Err(Self::explain)
    #[inline]
    pub fn e_explain<T, S: Into<ImmutStr>>(e: ErrorType, context: S) -> Result<T> {
        Err(Self::explain(e, context))
    }

    pub fn etype(&self) -> &ErrorType {
        &self.etype
    }

    pub fn esource(&self) -> &ErrorSource {
        &self.esource
    }

    pub fn context_str(&self) -> Option<&str> {
        self.context.as_ref().map(|c| c.as_str())
    }

    pub fn into_remote(mut self: BError) -> BError {
        self.esource = ErrorSource::Remote;
        self
    }

    pub fn into_local(mut self: BError) -> BError {
        self.esource = ErrorSource::Local;
        self
    }

    /// Iterate over this error and every [Error] in its cause chain, outermost first.
    ///
    /// The walk stops at the first cause that is not an [Error], see [Self::root_cause] for that.
    pub fn chain(&self) -> Chain<'_> {
        Chain { next: Some(self) }
    }

    /// The [ErrorType]s of [Self::chain], outermost first
    pub fn etype_chain(&self) -> Vec<&ErrorType> {
        self.chain().map(|e| &e.etype).collect()
    }

    /// Whether `etype` appears anywhere in the chain
    pub fn has_etype(&self, etype: &ErrorType) -> bool {
        self.chain().any(|e| &e.etype == etype)
    }

    /// Whether any error in the chain is timeout flavored
    pub fn is_timeout(&self) -> bool {
        self.chain().any(|e| e.etype.is_timeout())
    }

    /// Return the ErrorType of the root Error
    pub fn root_etype(&self) -> &ErrorType {
        // chain() always yields self first
        self.chain().last().map_or(&self.etype, |e| &e.etype)
    }

    pub fn root_cause(&self) -> &(dyn ErrorTrait + Send + Sync + 'static) {
        self.cause.as_deref().map_or(self, |c| {
            c.downcast_ref::<BError>().map_or(c, |e| e.root_cause())
        })
    }

    // skip the source and type when they repeat the previous hop
    fn chain_display(&self, previous: Option<&Error>, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if previous.map_or(true, |p| p.esource != self.esource) {
            f.write_str(self.esource.as_str())?
        }
        if previous.map_or(true, |p| p.etype != self.etype) {
            write!(f, " {}", self.etype.as_str())?
        }
        if let Some(c) = self.context.as_ref() {
            write!(f, " context: {c}")?;
        }
        match self.cause.as_ref() {
            Some(c) => match c.downcast_ref::<BError>() {
                Some(e) => {
                    f.write_str(" cause: ")?;
                    e.chain_display(Some(self), f)
                }
                None => write!(f, " cause: {c}"),
            },
            None => Ok(()),
        }
    }
}

/// Iterator returned by [Error::chain]
pub struct Chain<'a> {
    next: Option<&'a Error>,
}

impl<'a> Iterator for Chain<'a> {
    type Item = &'a Error;

    fn next(&mut self) -> Option<&'a Error> {
        let current = self.next.take()?;
        self.next = current
            .cause
            .as_ref()
            .and_then(|c| c.downcast_ref::<BError>())
            .map(|e| e.as_ref());
        Some(current)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.chain_display(None, f)
    }
}

impl ErrorTrait for Error {}

/// Helper trait to chain errors with context
pub trait OrErr<T, E> {
    /// Wrap the E in [Result] with new [ErrorType] and context, the existing E will be the cause.
    fn or_err(self, et: ErrorType, context: &'static str) -> Result<T, BError>
    where
        E: Into<Cause>;

    /// Similar to or_err(), but takes a closure, which is useful for constructing String.
    fn or_err_with<C: Into<ImmutStr>, F: FnOnce() -> C>(
        self,
        et: ErrorType,
        context: F,
    ) -> Result<T, BError>
    where
        E: Into<Cause>;

    /// Replace the E in [Result] with a new [Error] generated from the current error
    fn explain_err<C: Into<ImmutStr>, F: FnOnce(E) -> C>(
        self,
        et: ErrorType,
        context: F,
    ) -> Result<T, BError>;
}

impl<T, E> OrErr<T, E> for Result<T, E> {
    fn or_err(self, et: ErrorType, context: &'static str) -> Result<T, BError>
    where
        E: Into<Cause>,
    {
        self.map_err(|e| Error::because(et, context, e))
    }

    fn or_err_with<C: Into<ImmutStr>, F: FnOnce() -> C>(
        self,
        et: ErrorType,
        context: F,
    ) -> Result<T, BError>
    where
        E: Into<Cause>,
    {
        self.map_err(|e| Error::because(et, context(), e))
    }

    fn explain_err<C: Into<ImmutStr>, F: FnOnce(E) -> C>(
        self,
        et: ErrorType,
        exp: F,
    ) -> Result<T, BError> {
        self.map_err(|e| Error::explain(et, exp(e)))
    }
}

/// Helper trait to convert an [Option] to an [Error] with context.
pub trait OkOrErr<T> {
    fn or_err(self, et: ErrorType, context: &'static str) -> Result<T, BError>;

    fn or_err_with<C: Into<ImmutStr>, F: FnOnce() -> C>(
        self,
        et: ErrorType,
        context: F,
    ) -> Result<T, BError>;
}

impl<T> OkOrErr<T> for Option<T> {
    fn or_err(self, et: ErrorType, context: &'static str) -> Result<T, BError> {
        self.ok_or_else(|| Error::explain(et, context))
    }

    fn or_err_with<C: Into<ImmutStr>, F: FnOnce() -> C>(
        self,
        et: ErrorType,
        context: F,
    ) -> Result<T, BError> {
        self.ok_or_else(|| Error::explain(et, context()))
    }
}
