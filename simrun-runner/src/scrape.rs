//! Error banner scraping
//!
//! The wrapped simulators report failures as free text. When a job fails,
//! the tail of `run.log` is searched for known banners and the matching
//! lines become the error shown to the user.

use regex::Regex;

use crate::error::Result;

/// Banners printed by most of the wrapped tools and their runtimes
const DEFAULT_PATTERNS: &[&str] = &[
    r"^\s*Error:",
    r"^\s*ERROR",
    r"Traceback \(most recent call last\)",
    r"Segmentation fault",
];

/// Maximum number of matched lines kept in a job's error
const MAX_ERROR_LINES: usize = 5;

#[derive(Debug, Clone)]
pub struct ErrorScraper {
    patterns: Vec<Regex>,
}

impl ErrorScraper {
    /// Default banners plus job-specific `extra` patterns
    pub fn new(extra: &[String]) -> Result<Self> {
        let patterns = DEFAULT_PATTERNS
            .iter()
            .map(|p| p.to_string())
            .chain(extra.iter().cloned())
            .map(|p| Regex::new(&p))
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(Self { patterns })
    }

    /// Returns the last matching lines, joined
    pub fn scrape(&self, lines: &[String]) -> Option<String> {
        let matched: Vec<&str> = lines
            .iter()
            .filter(|line| self.patterns.iter().any(|p| p.is_match(line)))
            .map(|line| line.trim_end())
            .collect();
        if matched.is_empty() {
            return None;
        }
        let start = matched.len().saturating_sub(MAX_ERROR_LINES);
        Some(matched[start..].join("\n"))
    }

    /// Error text for a failed job, falling back to the exit code
    pub fn describe_failure(&self, lines: &[String], exit_code: Option<i32>) -> String {
        self.scrape(lines).unwrap_or_else(|| match exit_code {
            Some(code) => format!("exit code {}", code),
            None => "job failed".to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lines(text: &str) -> Vec<String> {
        text.lines().map(String::from).collect()
    }

    #[test]
    fn test_default_banners() {
        let scraper = ErrorScraper::new(&[]).unwrap();
        let log = lines("tracking 100 particles\nError: lattice file not found\ndone");
        assert_eq!(
            scraper.scrape(&log).as_deref(),
            Some("Error: lattice file not found")
        );
    }

    #[test]
    fn test_job_specific_pattern() {
        let scraper = ErrorScraper::new(&[r"^\s*\*+ ?fatal".to_string()]).unwrap();
        let log = lines("step 1\n*** fatal: element QF undefined\n");
        assert_eq!(
            scraper.scrape(&log).as_deref(),
            Some("*** fatal: element QF undefined")
        );
    }

    #[test]
    fn test_keeps_last_matches() {
        let scraper = ErrorScraper::new(&[]).unwrap();
        let log: Vec<String> = (0..8).map(|i| format!("ERROR {}", i)).collect();
        let error = scraper.scrape(&log).unwrap();
        assert_eq!(error.lines().count(), MAX_ERROR_LINES);
        assert!(error.starts_with("ERROR 3"));
        assert!(error.ends_with("ERROR 7"));
    }

    #[test]
    fn test_fallback_to_exit_code() {
        let scraper = ErrorScraper::new(&[]).unwrap();
        assert_eq!(
            scraper.describe_failure(&lines("all quiet"), Some(3)),
            "exit code 3"
        );
        assert_eq!(scraper.describe_failure(&[], None), "job failed");
    }

    #[test]
    fn test_invalid_pattern() {
        assert!(ErrorScraper::new(&["(unclosed".to_string()]).is_err());
    }
}
