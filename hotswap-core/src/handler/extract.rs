//! Typed handler parameters
//!
//! A handler is a plain closure whose parameters are resolved from the
//! event being handled, by type.

use crate::classfile::ClassFile;
use crate::loader::LoaderId;
use crate::monitor::{FileEvent, WatchFileEvent};
use std::fmt;
use std::marker::PhantomData;
use std::path::PathBuf;
use thiserror::Error;
use url::Url;

/// Everything a handler parameter can be resolved from
#[derive(Debug, Clone, Copy)]
pub struct Invocation<'a> {
    pub loader: LoaderId,
    pub event: &'a WatchFileEvent,
    pub class_file: Option<&'a ClassFile>,
    pub class_name: Option<&'a str>,
}

/// A value a handler can ask for as a parameter
pub trait FromInvocation: Sized {
    /// Whether the parameter needs a parsed class; handlers that do are not
    /// invoked for deleted class files
    const REQUIRES_CLASS: bool = false;

    /// Shown when the parameter cannot be resolved for a handler
    const DESCRIPTION: &'static str;

    fn from_invocation(invocation: &Invocation<'_>) -> Option<Self>;
}

impl FromInvocation for LoaderId {
    const DESCRIPTION: &'static str = "LoaderId";

    fn from_invocation(invocation: &Invocation<'_>) -> Option<Self> {
        Some(invocation.loader)
    }
}

impl FromInvocation for Url {
    const DESCRIPTION: &'static str = "Url";

    fn from_invocation(invocation: &Invocation<'_>) -> Option<Self> {
        Some(invocation.event.uri.clone())
    }
}

impl FromInvocation for PathBuf {
    const DESCRIPTION: &'static str = "PathBuf";

    fn from_invocation(invocation: &Invocation<'_>) -> Option<Self> {
        Some(invocation.event.path.clone())
    }
}

impl FromInvocation for FileEvent {
    const DESCRIPTION: &'static str = "FileEvent";

    fn from_invocation(invocation: &Invocation<'_>) -> Option<Self> {
        Some(invocation.event.kind)
    }
}

impl FromInvocation for WatchFileEvent {
    const DESCRIPTION: &'static str = "WatchFileEvent";

    fn from_invocation(invocation: &Invocation<'_>) -> Option<Self> {
        Some(invocation.event.clone())
    }
}

impl FromInvocation for ClassFile {
    const REQUIRES_CLASS: bool = true;
    const DESCRIPTION: &'static str = "ClassFile";

    fn from_invocation(invocation: &Invocation<'_>) -> Option<Self> {
        invocation.class_file.cloned()
    }
}

/// Binary name of the changed class; available for class file handlers,
/// including deletions
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClassName(pub String);

impl ClassName {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClassName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromInvocation for ClassName {
    const DESCRIPTION: &'static str = "ClassName";

    fn from_invocation(invocation: &Invocation<'_>) -> Option<Self> {
        invocation.class_name.map(|name| ClassName(name.to_string()))
    }
}

/// Error from invoking a handler
#[derive(Debug, Error)]
pub enum InvokeError {
    #[error("handler parameter of type {0} cannot be resolved")]
    Unresolved(&'static str),

    #[error("{0:#}")]
    Failed(anyhow::Error),
}

/// Handler return values
pub trait IntoHandlerResult {
    fn into_handler_result(self) -> anyhow::Result<()>;
}

impl IntoHandlerResult for () {
    fn into_handler_result(self) -> anyhow::Result<()> {
        Ok(())
    }
}

impl<E: Into<anyhow::Error>> IntoHandlerResult for Result<(), E> {
    fn into_handler_result(self) -> anyhow::Result<()> {
        self.map_err(Into::into)
    }
}

/// Type-erased handler
pub trait WatchHandler: Send + Sync + 'static {
    fn requires_class(&self) -> bool;

    fn call(&self, invocation: &Invocation<'_>) -> Result<(), InvokeError>;
}

/// Conversion of a closure into a [`WatchHandler`]. `Args` is the tuple of
/// parameter types and is inferred from the closure.
pub trait IntoWatchHandler<Args> {
    fn into_handler(self) -> Box<dyn WatchHandler>;
}

struct FnHandler<F, Args> {
    f: F,
    _args: PhantomData<fn() -> Args>,
}

macro_rules! impl_handler {
    ($($ty:ident),*) => {
        impl<F, R, $($ty,)*> WatchHandler for FnHandler<F, ($($ty,)*)>
        where
            F: Fn($($ty),*) -> R + Send + Sync + 'static,
            R: IntoHandlerResult,
            $($ty: FromInvocation + 'static,)*
        {
            fn requires_class(&self) -> bool {
                false $(|| <$ty as FromInvocation>::REQUIRES_CLASS)*
            }

            #[allow(non_snake_case, unused_variables)]
            fn call(&self, invocation: &Invocation<'_>) -> Result<(), InvokeError> {
                $(
                    let $ty = <$ty as FromInvocation>::from_invocation(invocation)
                        .ok_or(InvokeError::Unresolved(<$ty as FromInvocation>::DESCRIPTION))?;
                )*
                (self.f)($($ty),*).into_handler_result().map_err(InvokeError::Failed)
            }
        }

        impl<F, R, $($ty,)*> IntoWatchHandler<($($ty,)*)> for F
        where
            F: Fn($($ty),*) -> R + Send + Sync + 'static,
            R: IntoHandlerResult,
            $($ty: FromInvocation + 'static,)*
        {
            fn into_handler(self) -> Box<dyn WatchHandler> {
                Box::new(FnHandler { f: self, _args: PhantomData::<fn() -> ($($ty,)*)> })
            }
        }
    };
}

impl_handler!();
impl_handler!(T1);
impl_handler!(T1, T2);
impl_handler!(T1, T2, T3);
impl_handler!(T1, T2, T3, T4);
