use std::fmt::Write as _;

use anyhow::{anyhow, Result};

/// Fold a list of per-item failures into a single error, keeping every
/// message. An empty list is success.
pub fn join_errors(errs: Vec<anyhow::Error>) -> Result<()> {
    match errs.len() {
        0 => Ok(()),
        1 => Err(errs.into_iter().next().unwrap()),
        n => {
            let mut msg = format!("{n} errors occurred:");
            for e in errs {
                write!(msg, "\n  - {e:#}").unwrap();
            }
            Err(anyhow!(msg))
        }
    }
}
