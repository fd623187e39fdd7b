//! # Scopegen
//!
//! Scoped consumption of lazy async producers, with a guaranteed single close.
//!
//! ## Overview
//!
//! A producer holds resources for as long as it is producing: a socket, a
//! file, a lock. [`ScopedStream`] lets a caller consume one inside a scope and
//! guarantees that leaving the scope closes the producer exactly once, whether
//! the scope finished, stopped early or failed. The same adapter is also a
//! [`futures::Stream`] for direct iteration.
//!
//! ## Features
//!
//! - **🔒 Scoped consumption**: [`ScopedStream::enter`] / [`ScopedStream::exit`],
//!   or [`ScopedStream::scope`] to run a body between them
//! - **🌊 Direct iteration**: `ScopedStream` is a [`futures::Stream`]
//! - **🧹 Async cleanup**: [`Generator`] bodies register cleanup with [`Co::defer`]
//!
//! ## Quick Start
//!
//! ```rust
//! use scopegen::{ExitReason, Generator, ProducerExt, ScopedStream};
//! use futures::executor::block_on;
//!
//! let mut lines = ScopedStream::new(Generator::new(|co| async move {
//!     co.defer(async {
//!         println!("connection closed");
//!         Ok::<_, std::io::Error>(())
//!     });
//!     for line in ["a", "b", "c"] {
//!         co.yield_(line).await;
//!     }
//!     Ok(())
//! }));
//!
//! block_on(async {
//!     let producer = lines.enter().await?;
//!     let first = producer.next().await;
//!     println!("{first:?}");
//!     lines.exit(ExitReason::Break).await
//! })
//! .unwrap();
//! ```

pub mod error;
pub mod generator;
pub mod producer;
pub mod scope;

pub use error::{Error, Result};
pub use generator::{Co, Generator};
pub use producer::{FromStream, Producer, ProducerExt};
pub use scope::{DropClose, ExitReason, ScopedResource, ScopedStream, State};

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{BufRead, BufReader, Write};
    use std::path::PathBuf;

    fn lines_of(path: PathBuf) -> Generator<'static, String, std::io::Error> {
        Generator::new(move |co| async move {
            let file = std::fs::File::open(&path)?;
            let cleanup_path = path.clone();
            co.defer(async move { tokio::fs::remove_file(cleanup_path).await });
            for line in BufReader::new(file).lines() {
                co.yield_(line?).await;
            }
            Ok(())
        })
    }

    #[tokio::test]
    async fn leaving_a_scope_early_releases_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rows.txt");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "first\nsecond\nthird").unwrap();
        drop(file);

        let mut rows = ScopedStream::new(lines_of(path.clone()));
        let first = rows
            .scope(async |producer| {
                producer
                    .next()
                    .await
                    .transpose()
                    .map_err(Error::Producer)
            })
            .await
            .unwrap();

        assert_eq!(first.as_deref(), Some("first"));
        assert!(rows.is_producer_closed());
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn producer_failure_is_passed_through_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing.txt");

        let mut rows = ScopedStream::new(lines_of(missing));
        let error = rows.pull().await.unwrap_err();

        let io_error = error.into_producer().unwrap();
        assert_eq!(io_error.kind(), std::io::ErrorKind::NotFound);
        assert!(rows.pull().await.unwrap_err().is_exhausted());
    }
}
