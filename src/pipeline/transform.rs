//! Caption rewriting.
//!
//! Stages run in a fixed order: remove lines, literal replace, beautify,
//! cleanup, footer. Everything except the emoji draw in beautify is
//! deterministic; pass your own RNG to [`ContentTransformer::transform_with_rng`]
//! to pin that too.

use rand::Rng;
use rand::seq::SliceRandom;
use regex::Regex;

use crate::error::ConfigError;
use crate::tasks::model::ModificationConfig;

/// Host patterns recognised by beautify (regex fragments, matched after
/// the scheme).
pub const DEFAULT_LINK_HOSTS: &[&str] = &[r"tera[a-z]+\.com", r"tinyurl\.com", r"teraboxurl\.com"];

pub const DEFAULT_TITLE: &str = "Watch Full Videos";

pub const DEFAULT_PALETTE: &[&str] = &["😍", "🔥", "❤️", "😈", "💯", "💦", "🔞"];

/// Number of emoji appended to the title.
const TITLE_EMOJI: usize = 2;

/// Beautify settings shared by every task.
#[derive(Debug, Clone)]
pub struct BeautifyConfig {
    pub link_hosts: Vec<String>,
    pub title: String,
    pub palette: Vec<String>,
}

impl Default for BeautifyConfig {
    fn default() -> Self {
        Self {
            link_hosts: DEFAULT_LINK_HOSTS.iter().map(|s| s.to_string()).collect(),
            title: DEFAULT_TITLE.to_string(),
            palette: DEFAULT_PALETTE.iter().map(|s| s.to_string()).collect(),
        }
    }
}

/// Compiled transformer; build once, share across tasks.
#[derive(Debug, Clone)]
pub struct ContentTransformer {
    link_pattern: Regex,
    blank_runs: Regex,
    title: String,
    palette: Vec<String>,
}

impl ContentTransformer {
    pub fn new(config: BeautifyConfig) -> Result<Self, ConfigError> {
        if config.link_hosts.is_empty() {
            return Err(ConfigError::InvalidValue {
                key: "link_hosts".into(),
                message: "at least one host pattern is required".into(),
            });
        }

        let hosts = config.link_hosts.join("|");
        let link_pattern = Regex::new(&format!(r"https?://(?:{hosts})/\S+")).map_err(|e| {
            ConfigError::InvalidValue {
                key: "link_hosts".into(),
                message: e.to_string(),
            }
        })?;
        let blank_runs =
            Regex::new(r"\n{3,}").map_err(|e| ConfigError::ParseError(e.to_string()))?;

        Ok(Self {
            link_pattern,
            blank_runs,
            title: config.title,
            palette: config.palette,
        })
    }

    /// Build with the stock host list, title and palette.
    pub fn with_defaults() -> Result<Self, ConfigError> {
        Self::new(BeautifyConfig::default())
    }

    pub fn transform(&self, mods: &ModificationConfig, raw: &str) -> String {
        self.transform_with_rng(mods, raw, &mut rand::thread_rng())
    }

    pub fn transform_with_rng<R: Rng + ?Sized>(
        &self,
        mods: &ModificationConfig,
        raw: &str,
        rng: &mut R,
    ) -> String {
        let mut text = remove_lines(raw, &mods.remove_lines);

        for rule in &mods.replace_rules {
            text = text.replace(&rule.find, &rule.replace);
        }

        if mods.beautify {
            if let Some(caption) = self.beautify(&text, rng) {
                text = caption;
            }
        }

        let body = self.blank_runs.replace_all(&text, "\n\n");
        let body = body.trim();

        match mods.footer.as_deref() {
            Some(footer) if !footer.is_empty() => format!("{body}\n\n{footer}"),
            _ => body.to_string(),
        }
    }

    /// Links in `text` on a recognised host, in first-seen order.
    pub fn extract_links<'t>(&self, text: &'t str) -> Vec<&'t str> {
        self.link_pattern.find_iter(text).map(|m| m.as_str()).collect()
    }

    /// Generated caption, or `None` when no link matches.
    fn beautify<R: Rng + ?Sized>(&self, text: &str, rng: &mut R) -> Option<String> {
        let links = self.extract_links(text);
        if links.is_empty() {
            return None;
        }

        let emoji: String = self
            .palette
            .choose_multiple(rng, TITLE_EMOJI)
            .map(String::as_str)
            .collect();

        let blocks: Vec<String> = links
            .iter()
            .enumerate()
            .map(|(i, link)| format!("V{}:\n{link}", i + 1))
            .collect();

        Some(format!("{} {emoji}\n\n{}", self.title, blocks.join("\n\n")))
    }
}

/// Drop lines whose trimmed content equals a trimmed, non-blank phrase.
fn remove_lines(text: &str, phrases: &[String]) -> String {
    let phrases: Vec<&str> = phrases
        .iter()
        .map(|p| p.trim())
        .filter(|p| !p.is_empty())
        .collect();
    if phrases.is_empty() {
        return text.to_string();
    }

    text.split('\n')
        .filter(|line| !phrases.contains(&line.trim()))
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tasks::model::ReplaceRule;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn transformer() -> ContentTransformer {
        ContentTransformer::with_defaults().unwrap()
    }

    fn mods() -> ModificationConfig {
        ModificationConfig::default()
    }

    fn rule(find: &str, replace: &str) -> ReplaceRule {
        ReplaceRule {
            find: find.into(),
            replace: replace.into(),
        }
    }

    #[test]
    fn no_modifications_only_trims() {
        assert_eq!(transformer().transform(&mods(), "  hello  \n"), "hello");
    }

    #[test]
    fn removes_exact_lines() {
        let m = ModificationConfig {
            remove_lines: vec!["Subscribe now".into()],
            ..mods()
        };
        assert_eq!(
            transformer().transform(&m, "Hello\nSubscribe now\nBye"),
            "Hello\nBye"
        );
    }

    #[test]
    fn removal_compares_trimmed_and_whole_line() {
        let m = ModificationConfig {
            remove_lines: vec!["  Join us  ".into()],
            ..mods()
        };
        let out = transformer().transform(&m, "a\n   Join us\t\nPlease Join us today");
        assert_eq!(out, "a\nPlease Join us today");
    }

    #[test]
    fn blank_removal_phrase_keeps_blank_lines() {
        let m = ModificationConfig {
            remove_lines: vec!["   ".into()],
            ..mods()
        };
        assert_eq!(transformer().transform(&m, "a\n\nb"), "a\n\nb");
    }

    #[test]
    fn replace_rule_applies_everywhere() {
        let m = ModificationConfig {
            replace_rules: vec![rule("cat", "dog")],
            ..mods()
        };
        assert_eq!(transformer().transform(&m, "I love cat"), "I love dog");
        assert_eq!(transformer().transform(&m, "cat cat"), "dog dog");
    }

    #[test]
    fn replace_rules_apply_in_order() {
        let m = ModificationConfig {
            replace_rules: vec![rule("a", "b"), rule("b", "c")],
            ..mods()
        };
        assert_eq!(transformer().transform(&m, "a"), "c");
    }

    #[test]
    fn replace_runs_after_removal() {
        let m = ModificationConfig {
            remove_lines: vec!["drop me".into()],
            replace_rules: vec![rule("keep", "drop me")],
            ..mods()
        };
        assert_eq!(transformer().transform(&m, "keep\ndrop me"), "drop me");
    }

    #[test]
    fn cleanup_collapses_blank_runs() {
        let out = transformer().transform(&mods(), "\n\na\n\n\n\nb\n\n\n");
        assert_eq!(out, "a\n\nb");
    }

    #[test]
    fn footer_appended_after_blank_line() {
        let m = ModificationConfig {
            footer: Some("via @mychannel".into()),
            ..mods()
        };
        assert_eq!(
            transformer().transform(&m, "News\n\n\n"),
            "News\n\nvia @mychannel"
        );
    }

    #[test]
    fn footer_kept_for_empty_body() {
        let m = ModificationConfig {
            remove_lines: vec!["only line".into()],
            footer: Some("footer".into()),
            ..mods()
        };
        let out = transformer().transform(&m, "only line");
        assert!(out.ends_with("\n\nfooter"));
        assert_eq!(out.trim(), "footer");
    }

    #[test]
    fn beautify_builds_numbered_link_blocks() {
        let m = ModificationConfig {
            beautify: true,
            ..mods()
        };
        let raw = "New drop!\nhttps://teraboxapp.com/s/abc first\nand http://tinyurl.com/xyz";
        let out = transformer().transform(&m, raw);

        assert!(out.starts_with(DEFAULT_TITLE));
        let first = out.find("V1:\nhttps://teraboxapp.com/s/abc").unwrap();
        let second = out.find("V2:\nhttp://tinyurl.com/xyz").unwrap();
        assert!(first < second);
        assert!(!out.contains("New drop!"));
    }

    #[test]
    fn beautify_layout_is_structural() {
        let m = ModificationConfig {
            beautify: true,
            ..mods()
        };
        let mut rng = StdRng::seed_from_u64(7);
        let out = transformer().transform_with_rng(
            &m,
            "https://terabox.com/a https://teraboxurl.com/b",
            &mut rng,
        );
        let lines: Vec<&str> = out.split('\n').collect();
        assert_eq!(lines.len(), 7);
        assert!(lines[0].starts_with("Watch Full Videos "));
        assert_eq!(&lines[1..], &["", "V1:", "https://terabox.com/a", "", "V2:", "https://teraboxurl.com/b"]);
    }

    #[test]
    fn beautify_draws_two_distinct_emoji() {
        let m = ModificationConfig {
            beautify: true,
            ..mods()
        };
        let t = transformer();
        for seed in 0..20 {
            let mut rng = StdRng::seed_from_u64(seed);
            let out = t.transform_with_rng(&m, "https://terabox.com/x", &mut rng);
            let title = out.lines().next().unwrap();
            let suffix = title.strip_prefix("Watch Full Videos ").unwrap();
            let drawn: Vec<&str> = DEFAULT_PALETTE
                .iter()
                .copied()
                .filter(|e| suffix.contains(e))
                .collect();
            assert_eq!(drawn.len(), 2, "title was {title:?}");
        }
    }

    #[test]
    fn beautify_without_links_is_noop() {
        let t = transformer();
        let base = ModificationConfig {
            remove_lines: vec!["ad".into()],
            replace_rules: vec![rule("cat", "dog")],
            footer: Some("f".into()),
            ..mods()
        };
        let with = ModificationConfig {
            beautify: true,
            ..base.clone()
        };
        let raw = "cat pics\nad\n\n\n\nhttps://example.com/cat";
        assert_eq!(t.transform(&with, raw), t.transform(&base, raw));
    }

    #[test]
    fn beautify_footer_still_applies() {
        let m = ModificationConfig {
            beautify: true,
            footer: Some("join".into()),
            ..mods()
        };
        let out = transformer().transform(&m, "https://tinyurl.com/q");
        assert!(out.ends_with("V1:\nhttps://tinyurl.com/q\n\njoin"));
    }

    #[test]
    fn repeated_links_are_kept() {
        let t = transformer();
        let links = t.extract_links("https://tinyurl.com/a x https://tinyurl.com/a");
        assert_eq!(links, vec!["https://tinyurl.com/a", "https://tinyurl.com/a"]);
    }

    #[test]
    fn unknown_hosts_not_extracted() {
        let t = transformer();
        assert!(t.extract_links("https://example.com/a http://tera.com/x").is_empty());
    }

    #[test]
    fn custom_hosts_and_title() {
        let t = ContentTransformer::new(BeautifyConfig {
            link_hosts: vec![r"example\.org".into()],
            title: "Links".into(),
            palette: vec!["a".into(), "b".into()],
        })
        .unwrap();
        let m = ModificationConfig {
            beautify: true,
            ..mods()
        };
        let out = t.transform(&m, "see https://example.org/p");
        let title = out.lines().next().unwrap();
        assert!(title == "Links ab" || title == "Links ba", "title was {title:?}");
        assert!(out.ends_with("V1:\nhttps://example.org/p"));
    }

    #[test]
    fn invalid_host_pattern_rejected() {
        let err = ContentTransformer::new(BeautifyConfig {
            link_hosts: vec!["(".into()],
            ..Default::default()
        })
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));

        let err = ContentTransformer::new(BeautifyConfig {
            link_hosts: vec![],
            ..Default::default()
        })
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }
}
