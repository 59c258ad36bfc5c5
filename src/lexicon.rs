//! Phrase tables for the text classifier.
//!
//! The tables are plain data: new locales or phrases are added by editing a
//! JSON file and passing it with `--lexicon`, not by recompiling. The built-in
//! default carries English and Spanish entries.

use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};

/// The mask token `sanitize` substitutes for insult and mocking phrases.
pub const DEFAULT_MASK: &str = "[removed]";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Lexicon {
    #[serde(default = "default_mask")]
    pub mask: String,
    pub threat: Vec<String>,
    pub insult: Vec<String>,
    pub mocking: Vec<String>,
    pub exclusion: Vec<String>,
    pub harassment: Vec<String>,
}

fn default_mask() -> String {
    DEFAULT_MASK.to_string()
}

impl Lexicon {
    /// Built-in bilingual phrase tables used when no file is supplied.
    pub fn builtin() -> Lexicon {
        Lexicon {
            mask: default_mask(),
            threat: strings(&[
                "kill you",
                "hurt you",
                "harm you",
                "beat you up",
                "going to get you",
                "you will regret",
                "te voy a pegar",
                "te voy a hacer daño",
                "te vas a arrepentir",
            ]),
            insult: strings(&[
                "stupid",
                "idiot",
                "loser",
                "dumb",
                "worthless",
                "pathetic",
                "estúpido",
                "idiota",
                "tonto",
                "inútil",
            ]),
            mocking: strings(&[
                "crybaby",
                "everyone laughs at you",
                "you always fail",
                "can't even",
                "llorón",
                "todos se ríen de ti",
                "siempre fallas",
            ]),
            exclusion: strings(&[
                "you can't play",
                "not invited",
                "nobody wants you",
                "go away",
                "we don't want you",
                "no puedes jugar",
                "nadie te quiere",
                "vete de aquí",
            ]),
            harassment: strings(&[
                "shut up",
                "leave me alone or else",
                "i'm watching you",
                "cállate",
                "te estoy vigilando",
            ]),
        }
    }

    /// Load a lexicon from a JSON file, lowercasing every phrase so matching
    /// stays case-insensitive no matter how the file was written.
    pub fn from_file(path: &Path) -> anyhow::Result<Lexicon> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read lexicon file {}", path.display()))?;
        let mut lexicon: Lexicon =
            serde_json::from_str(&raw).context("lexicon file is not valid JSON")?;
        lexicon.normalize();
        Ok(lexicon)
    }

    fn normalize(&mut self) {
        for table in [
            &mut self.threat,
            &mut self.insult,
            &mut self.mocking,
            &mut self.exclusion,
            &mut self.harassment,
        ] {
            for phrase in table.iter_mut() {
                *phrase = phrase.trim().to_lowercase();
            }
            table.retain(|phrase| !phrase.is_empty());
        }
    }
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_tables_are_lowercase_and_nonempty() {
        let lexicon = Lexicon::builtin();
        for table in [
            &lexicon.threat,
            &lexicon.insult,
            &lexicon.mocking,
            &lexicon.exclusion,
            &lexicon.harassment,
        ] {
            assert!(!table.is_empty());
            for phrase in table {
                assert_eq!(phrase, &phrase.to_lowercase());
            }
        }
    }

    #[test]
    fn file_phrases_are_normalized_on_load() {
        let mut lexicon: Lexicon = serde_json::from_str(
            r#"{
                "threat": ["  Hurt You "],
                "insult": ["IDIOT", ""],
                "mocking": [],
                "exclusion": [],
                "harassment": []
            }"#,
        )
        .unwrap();
        lexicon.normalize();
        assert_eq!(lexicon.threat, vec!["hurt you".to_string()]);
        assert_eq!(lexicon.insult, vec!["idiot".to_string()]);
        assert_eq!(lexicon.mask, DEFAULT_MASK);
    }
}
