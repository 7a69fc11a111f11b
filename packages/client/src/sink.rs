//! Destinations for streamed remote output.

use std::sync::OnceLock;

use regex::Regex;

/// Receives stdout and stderr lines as they stream back from a node.
pub trait LogSink {
    fn stdout(&mut self, lines: &[String]);
    fn stderr(&mut self, lines: &[String]);
}

fn progress_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(.+)%\|(.+)\|\s+(.+)/(.+)").expect("static pattern compiles")
    })
}

/// Prints remote output to the local terminal.
///
/// Progress-bar lines (the `NN%|bar| n/total` shape) are written without a
/// trailing newline and rewound with a carriage return, so a running bar
/// overwrites itself in place instead of scrolling, matching how the bar
/// renders when the program runs locally.
#[derive(Default)]
pub struct ConsoleSink {
    last_was_progress: bool,
}

impl ConsoleSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// What one stdout line writes to the terminal, given what preceded it.
    fn render(&mut self, line: &str) -> String {
        let is_progress = progress_pattern().is_match(line);
        let mut out = String::new();
        if self.last_was_progress {
            // The previous bar left the cursor on its own line.
            out.push(if is_progress { '\r' } else { '\n' });
        }
        out.push_str(line);
        if !is_progress {
            out.push('\n');
        }
        self.last_was_progress = is_progress;
        out
    }
}

impl LogSink for ConsoleSink {
    fn stdout(&mut self, lines: &[String]) {
        use std::io::Write;

        for line in lines {
            print!("{}", self.render(line));
        }
        let _ = std::io::stdout().flush();
    }

    fn stderr(&mut self, lines: &[String]) {
        if self.last_was_progress {
            println!();
            self.last_was_progress = false;
        }
        for line in lines {
            eprintln!("{}", line);
        }
    }
}

/// Collects streamed lines in memory.
#[derive(Default)]
pub struct CollectSink {
    pub stdout: Vec<String>,
    pub stderr: Vec<String>,
}

impl CollectSink {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LogSink for CollectSink {
    fn stdout(&mut self, lines: &[String]) {
        self.stdout.extend_from_slice(lines);
    }

    fn stderr(&mut self, lines: &[String]) {
        self.stderr.extend_from_slice(lines);
    }
}
