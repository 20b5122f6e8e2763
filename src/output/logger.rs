//! Scoped debug logging to stderr.
//!
//! Scopes nest with dots (`qtap.server_1.client_3`) so a verbose trace can
//! be followed per component. Debug lines print only with `--verbose` or
//! `--debug`; warnings always print.

use chrono::Local;
use colored::Colorize;

#[derive(Debug, Clone)]
pub struct Logger {
    verbose: bool,
    scope: String,
}

impl Logger {
    pub fn new(verbose: bool) -> Self {
        Logger {
            verbose,
            scope: "qtap".to_string(),
        }
    }

    /// A child logger with `.name` appended to the scope.
    pub fn scoped(&self, name: &str) -> Logger {
        Logger {
            verbose: self.verbose,
            scope: format!("{}.{}", self.scope, name),
        }
    }

    pub fn debug(&self, message: impl AsRef<str>) {
        if !self.verbose {
            return;
        }
        let ts = Local::now().format("%H:%M:%S%.3f");
        eprintln!(
            "{} {} {}",
            ts.to_string().dimmed(),
            format!("[{}]", self.scope).cyan().dimmed(),
            message.as_ref().dimmed()
        );
    }

    pub fn warn(&self, message: impl AsRef<str>) {
        eprintln!(
            "{} {}",
            format!("[{}]", self.scope).yellow(),
            message.as_ref().yellow()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scopes_nest_with_dots() {
        let root = Logger::new(false);
        let child = root.scoped("server_1").scoped("client_3");
        assert_eq!(child.scope, "qtap.server_1.client_3");
    }

    #[test]
    fn verbosity_is_inherited() {
        let root = Logger::new(true);
        assert!(root.scoped("anything").verbose);
    }
}
