use grep::regex::RegexMatcher;
use grep::searcher::{Searcher, Sink, SinkMatch};
use std::error::Error;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

// Source directories covered by the policy scans.
const SOURCE_ROOTS: [&str; 6] = ["ensemble", "features", "shared", "cli", "tests", "benches"];

// Collects matching lines from a single file to build one error message.
struct ViolationCollector {
    violations: Vec<String>,
    file_path: PathBuf,
    skip_strings_and_comments: bool,
}

impl ViolationCollector {
    fn new(file_path: &Path, skip_strings_and_comments: bool) -> Self {
        Self {
            violations: Vec::new(),
            file_path: file_path.to_path_buf(),
            skip_strings_and_comments,
        }
    }

    fn check_and_get_error_message(&self, what: &str, advice: &str) -> Option<String> {
        if self.violations.is_empty() {
            return None;
        }

        let file_name = self.file_path.to_str().unwrap_or("?");
        let mut error_msg = format!(
            "\n❌ ERROR: Found {} {what} in {file_name}:\n",
            self.violations.len()
        );
        for violation in &self.violations {
            error_msg.push_str(&format!("   {violation}\n"));
        }
        error_msg.push_str(&format!(
            "\n⚠️ {what} are not allowed in this project.\n   {advice}\n"
        ));
        Some(error_msg)
    }
}

impl Sink for ViolationCollector {
    type Error = std::io::Error;

    fn matched(&mut self, _: &Searcher, mat: &SinkMatch) -> Result<bool, Self::Error> {
        let line_number = mat.line_number().unwrap_or(0);
        let line_text = std::str::from_utf8(mat.bytes()).unwrap_or("").trim_end();

        if self.skip_strings_and_comments {
            let trimmed = line_text.trim_start();
            if trimmed.starts_with("//") || trimmed.starts_with("/*") {
                return Ok(true);
            }
            // Text between an odd and even quote is a string literal.
            let in_string = line_text
                .split('"')
                .enumerate()
                .any(|(i, part)| i % 2 == 1 && part.contains('_'));
            if in_string {
                return Ok(true);
            }
        }

        self.violations.push(format!("{line_number}:{line_text}"));
        Ok(true)
    }
}

fn main() {
    println!("cargo:rerun-if-changed=build.rs");
    for root in SOURCE_ROOTS {
        println!("cargo:rerun-if-changed={root}");
    }

    if let Err(e) = scan(
        r"\b(_[a-zA-Z0-9_]+)\b",
        true,
        "underscore-prefixed variables",
        "Either use the binding or remove it completely.",
    ) {
        eprintln!("{e}");
        std::process::exit(1);
    }

    if let Err(e) = scan(
        r"#\s*\[\s*allow\s*\(\s*dead_code\s*\)\s*\]",
        false,
        "#[allow(dead_code)] attributes",
        "Either use the code (removing the attribute) or remove it completely.",
    ) {
        eprintln!("{e}");
        std::process::exit(1);
    }
}

fn scan(
    pattern: &str,
    skip_strings_and_comments: bool,
    what: &str,
    advice: &str,
) -> Result<(), Box<dyn Error>> {
    let matcher = RegexMatcher::new_line_matcher(pattern)?;
    let mut searcher = Searcher::new();

    for root in SOURCE_ROOTS {
        for entry in WalkDir::new(root)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.path().extension().is_some_and(|ext| ext == "rs"))
        {
            let path = entry.path();
            let mut collector = ViolationCollector::new(path, skip_strings_and_comments);
            searcher.search_path(&matcher, path, &mut collector)?;

            if let Some(error_message) = collector.check_and_get_error_message(what, advice) {
                return Err(error_message.into());
            }
        }
    }

    Ok(())
}
