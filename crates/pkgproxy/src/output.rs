//! Startup banner and error reporting on stderr.

use std::fmt::Display;

use console::{Style, Term};

/// Width of the setting name column in the startup banner.
const NAME_WIDTH: usize = 14;

/// Writes the startup summary and fatal errors to stderr.
pub(crate) struct Console {
    term: Term,
    title: Style,
    name: Style,
    failure: Style,
}

impl Console {
    pub(crate) fn stderr() -> Self {
        Self {
            term: Term::stderr(),
            title: Style::new().cyan().bold(),
            name: Style::new().dim(),
            failure: Style::new().red().bold(),
        }
    }

    /// `pkgproxy <version>` heading.
    pub(crate) fn title(&self, version: &str) {
        self.line(&self.title.apply_to(format!("pkgproxy {version}")).to_string());
    }

    /// One `name  value` row under the heading.
    pub(crate) fn setting(&self, name: &str, value: impl Display) {
        let name = self.name.apply_to(format!("{name:<NAME_WIDTH$}"));
        self.line(&format!("  {name} {value}"));
    }

    /// Report an error that ends the process.
    pub(crate) fn failure(&self, err: &dyn Display) {
        self.line(&format!("{} {err}", self.failure.apply_to("error:")));
    }

    fn line(&self, text: &str) {
        let _ = self.term.write_line(text);
    }
}

