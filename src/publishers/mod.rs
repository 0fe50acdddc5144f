//! Facilities to describe messages to be published. Check out [`Publication`] as a starting point.
mod publication;

pub use publication::Publication;
