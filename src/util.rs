use std::fmt::Display;

use log::error;

pub(crate) trait LogError {
    fn pipe_log<S: AsRef<str>, Formatter: FnOnce() -> S>(self, f: Formatter) -> Self;
}

impl<T, E: Display> LogError for Result<T, E> {
    fn pipe_log<S: AsRef<str>, Formatter: FnOnce() -> S>(self, f: Formatter) -> Self {
        if let Err(ref e) = self {
            error!("{}: {}", f().as_ref(), e);
        }
        self
    }
}
