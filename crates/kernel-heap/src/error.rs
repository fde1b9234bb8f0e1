use core::{error::Error, fmt};

use allocator::InitError;
use ansi_term::{Color, WithFg};
use snafu::{Location, Snafu};

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum HeapInitError {
    #[snafu(display("invalid heap layout: {source}"))]
    Layout {
        #[snafu(implicit)]
        location: Location,
        #[snafu(source)]
        source: InitError,
    },
    #[snafu(display("failed to initialize heap allocator: {source}"))]
    Allocator {
        #[snafu(implicit)]
        location: Location,
        #[snafu(source)]
        source: InitError,
    },
}

/// Errors that record where they were raised.
pub trait Located {
    fn location(&self) -> &Location;
}

impl Located for HeapInitError {
    fn location(&self) -> &Location {
        match self {
            Self::Layout { location, .. } | Self::Allocator { location, .. } => location,
        }
    }
}

/// Formats an error with its location and source chain.
pub struct Report<E> {
    error: E,
}

impl<E> Report<E> {
    #[must_use]
    pub fn new(error: E) -> Self {
        Self { error }
    }
}

impl<E> fmt::Debug for Report<E>
where
    E: Error + Located,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl<E> fmt::Display for Report<E>
where
    E: Error + Located,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Error: {}", WithFg::new(Color::Red, &self.error))?;
        writeln!(f, "  at {}", WithFg::new(Color::DarkGray, self.error.location()))?;
        let mut source = self.error.source();
        if source.is_some() {
            writeln!(f)?;
            writeln!(f, "Caused by:")?;
        }
        let mut index = 0;
        while let Some(s) = source {
            writeln!(f, "{index:4}: {}", WithFg::new(Color::Red, s))?;
            source = s.source();
            index += 1;
        }
        Ok(())
    }
}

#[track_caller]
pub fn report<E>(err: E) -> !
where
    E: Error + Located,
{
    let panic_message = WithFg::new(Color::Red, "Critical error occurred");
    let report = Report::new(err);
    panic!("{panic_message}\n\n{report}");
}
