//! Language detection by unique-character scoring.
//!
//! Each configured language lists letters that do not occur in the other
//! configured languages' alphabets. Detection counts occurrences of each
//! language's unique letters and picks the highest score; ties and all-zero
//! scores fall back to the configured default. Adding a language means
//! extending the table — no language names appear in control flow.

/// One language's scoring profile.
#[derive(Debug, Clone)]
pub struct LanguageProfile {
    /// Language code, e.g. "ru" or "ua".
    pub code: String,
    /// Letters unique to this language among the configured set.
    pub unique_chars: Vec<char>,
}

/// Fixed alphabet table with a fallback language.
#[derive(Debug, Clone)]
pub struct LanguageTable {
    profiles: Vec<LanguageProfile>,
    fallback: String,
}

impl LanguageTable {
    pub fn new(profiles: Vec<LanguageProfile>, fallback: impl Into<String>) -> Self {
        Self {
            profiles,
            fallback: fallback.into(),
        }
    }

    /// Russian/Ukrainian table used by the production feeds.
    pub fn cyrillic_default() -> Self {
        Self::new(
            vec![
                LanguageProfile {
                    code: "ru".into(),
                    unique_chars: vec!['ё', 'ъ', 'ы', 'э'],
                },
                LanguageProfile {
                    code: "ua".into(),
                    unique_chars: vec!['ґ', 'є', 'і', 'ї'],
                },
            ],
            "ru",
        )
    }

    /// Detect the dominant language of `text` by unique-character count.
    pub fn detect(&self, text: &str) -> &str {
        let lower = text.to_lowercase();
        let mut best: Option<(&str, usize)> = None;
        let mut tied = false;

        for profile in &self.profiles {
            let score = lower
                .chars()
                .filter(|c| profile.unique_chars.contains(c))
                .count();
            match best {
                Some((_, top)) if score > top => {
                    best = Some((profile.code.as_str(), score));
                    tied = false;
                }
                Some((_, top)) if score == top => tied = true,
                None => best = Some((profile.code.as_str(), score)),
                _ => {}
            }
        }

        match best {
            Some((code, score)) if score > 0 && !tied => code,
            _ => &self.fallback,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_ukrainian_by_unique_letters() {
        let table = LanguageTable::cyrillic_default();
        assert_eq!(table.detect("Нова сукня, є всі розміри"), "ua");
    }

    #[test]
    fn detects_russian_by_unique_letters() {
        let table = LanguageTable::cyrillic_default();
        assert_eq!(table.detect("Новые платья, все размеры"), "ru");
    }

    #[test]
    fn zero_score_falls_back() {
        let table = LanguageTable::cyrillic_default();
        assert_eq!(table.detect("plain english text"), "ru");
    }

    #[test]
    fn tie_falls_back() {
        let table = LanguageTable::cyrillic_default();
        // One unique letter from each alphabet.
        assert_eq!(table.detect("ы і"), "ru");
    }

    #[test]
    fn detection_is_case_insensitive() {
        let table = LanguageTable::cyrillic_default();
        assert_eq!(table.detect("ЇЖАК"), "ua");
    }

    #[test]
    fn table_is_extensible() {
        let table = LanguageTable::new(
            vec![
                LanguageProfile { code: "pl".into(), unique_chars: vec!['ł', 'ż'] },
                LanguageProfile { code: "cz".into(), unique_chars: vec!['ř', 'ě'] },
            ],
            "pl",
        );
        assert_eq!(table.detect("řeka běží"), "cz");
    }
}
