//! CLI argument parsing using clap.

use clap::Parser;

/// Run HTML test files in real browsers and report their TAP results.
///
/// Each test file (or URL) is served through a local control proxy that
/// injects a small agent into the page; the agent streams the page's TAP
/// output back to qtap, which reports it per browser.
#[derive(Parser, Debug)]
#[command(name = "qtap", version, about, long_about = None)]
pub struct Args {
    /// Test HTML files or URLs
    #[arg(value_name = "FILE|URL", required = true)]
    pub files: Vec<String>,

    /// Browser to launch; repeatable [default: detect]
    #[arg(short = 'b', long = "browser", value_name = "NAME")]
    pub browser: Vec<String>,

    /// Config file defining custom browsers and defaults
    #[arg(short = 'c', long = "config", value_name = "FILE")]
    pub config: Option<String>,

    /// Root directory for the static server [default: current directory]
    #[arg(long, value_name = "DIR")]
    pub cwd: Option<String>,

    /// Idle timeout in seconds [default: 5]
    #[arg(long, value_name = "SECONDS")]
    pub timeout: Option<u64>,

    /// Browser startup timeout in seconds [default: 60]
    #[arg(long = "connect-timeout", value_name = "SECONDS")]
    pub connect_timeout: Option<u64>,

    /// Reporter: minimal, plain, json, none [default: minimal]
    #[arg(short = 'r', long = "reporter", value_name = "NAME")]
    pub reporter: Option<String>,

    /// Re-run whenever a test file changes
    #[arg(short = 'w', long)]
    pub watch: bool,

    /// Keep browsers open and enable internal logging (also: QTAP_DEBUG=1)
    #[arg(short = 'd', long)]
    pub debug: bool,

    /// Print internal logging
    #[arg(short = 'v', long)]
    pub verbose: bool,
}

impl Args {
    pub fn parse_args() -> Self {
        Self::parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn requires_at_least_one_file() {
        assert!(Args::try_parse_from(["qtap"]).is_err());
    }

    #[test]
    fn parses_positional_files() {
        let args = Args::try_parse_from(["qtap", "a.html", "b.html"]).unwrap();
        assert_eq!(args.files, vec!["a.html", "b.html"]);
        assert!(args.browser.is_empty());
        assert_eq!(args.timeout, None);
    }

    #[test]
    fn browser_flag_is_repeatable() {
        let args =
            Args::try_parse_from(["qtap", "-b", "firefox", "--browser", "chrome", "t.html"])
                .unwrap();
        assert_eq!(args.browser, vec!["firefox", "chrome"]);
    }

    #[test]
    fn timeouts_and_reporter_parse() {
        let args = Args::try_parse_from([
            "qtap",
            "--timeout",
            "2",
            "--connect-timeout",
            "10",
            "-r",
            "json",
            "t.html",
        ])
        .unwrap();
        assert_eq!(args.timeout, Some(2));
        assert_eq!(args.connect_timeout, Some(10));
        assert_eq!(args.reporter.as_deref(), Some("json"));
    }

    #[test]
    fn flags_default_off() {
        let args = Args::try_parse_from(["qtap", "t.html"]).unwrap();
        assert!(!args.watch);
        assert!(!args.debug);
        assert!(!args.verbose);
    }
}
