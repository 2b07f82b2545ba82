//! Static model catalog and language tables

/// A model the application knows how to fetch and run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CatalogEntry {
    pub id: &'static str,
    pub name: &'static str,
    pub repo_id: &'static str,
    pub ram_gb: u32,
    pub description: &'static str,
}

/// Translation model variants, in display order
pub const TRANSLATION_MODELS: &[CatalogEntry] = &[
    CatalogEntry {
        id: "4b",
        name: "TranslateGemma 4B (4-bit)",
        repo_id: "mlx-community/translategemma-4b-it-4bit",
        ram_gb: 4,
        description: "Default model, fast and lightweight (~2.2GB download)",
    },
    CatalogEntry {
        id: "4b-8bit",
        name: "TranslateGemma 4B (8-bit)",
        repo_id: "mlx-community/translategemma-4b-it-8bit",
        ram_gb: 6,
        description: "Higher precision 4B variant (~4.1GB download)",
    },
    CatalogEntry {
        id: "27b",
        name: "TranslateGemma 27B (4-bit)",
        repo_id: "mlx-community/translategemma-27b-it-4bit",
        ram_gb: 18,
        description: "Best quality, requires significant RAM (~15.2GB download)",
    },
];

/// The single built-in text-to-speech model
pub const TTS_MODEL: CatalogEntry = CatalogEntry {
    id: "tts",
    name: "Qwen3-TTS 0.6B",
    repo_id: "mlx-community/Qwen3-TTS-12Hz-0.6B-Base-bf16",
    ram_gb: 2,
    description: "Multilingual speech synthesis",
};

pub fn find_translation_model(id: &str) -> Option<&'static CatalogEntry> {
    TRANSLATION_MODELS.iter().find(|entry| entry.id == id)
}

/// Languages offered for translation, ISO 639-1 code to English name
pub const SUPPORTED_LANGUAGES: &[(&str, &str)] = &[
    ("af", "Afrikaans"),
    ("ar", "Arabic"),
    ("bg", "Bulgarian"),
    ("bn", "Bengali"),
    ("ca", "Catalan"),
    ("cs", "Czech"),
    ("da", "Danish"),
    ("de", "German"),
    ("el", "Greek"),
    ("en", "English"),
    ("es", "Spanish"),
    ("et", "Estonian"),
    ("fa", "Persian"),
    ("fi", "Finnish"),
    ("fil", "Filipino"),
    ("fr", "French"),
    ("gu", "Gujarati"),
    ("he", "Hebrew"),
    ("hi", "Hindi"),
    ("hr", "Croatian"),
    ("hu", "Hungarian"),
    ("id", "Indonesian"),
    ("is", "Icelandic"),
    ("it", "Italian"),
    ("ja", "Japanese"),
    ("kn", "Kannada"),
    ("ko", "Korean"),
    ("lt", "Lithuanian"),
    ("lv", "Latvian"),
    ("ml", "Malayalam"),
    ("mr", "Marathi"),
    ("ms", "Malay"),
    ("nl", "Dutch"),
    ("no", "Norwegian"),
    ("pa", "Punjabi"),
    ("pl", "Polish"),
    ("pt", "Portuguese"),
    ("ro", "Romanian"),
    ("ru", "Russian"),
    ("sk", "Slovak"),
    ("sl", "Slovenian"),
    ("sr", "Serbian"),
    ("sv", "Swedish"),
    ("sw", "Swahili"),
    ("ta", "Tamil"),
    ("te", "Telugu"),
    ("th", "Thai"),
    ("tr", "Turkish"),
    ("uk", "Ukrainian"),
    ("ur", "Urdu"),
    ("vi", "Vietnamese"),
    ("zh", "Chinese"),
    ("zu", "Zulu"),
];

/// Language name for a code, if known
pub fn language_name(code: &str) -> Option<&'static str> {
    SUPPORTED_LANGUAGES
        .iter()
        .find(|(c, _)| *c == code)
        .map(|(_, name)| *name)
}

/// Languages the TTS model accepts, by the full name it expects
pub const TTS_LANGUAGES: &[(&str, &str)] = &[
    ("zh", "Chinese"),
    ("en", "English"),
    ("ja", "Japanese"),
    ("ko", "Korean"),
    ("de", "German"),
    ("fr", "French"),
    ("ru", "Russian"),
    ("pt", "Portuguese"),
    ("es", "Spanish"),
    ("it", "Italian"),
];

/// Sent when the TTS model should detect the language itself
pub const TTS_AUTO_LANGUAGE: &str = "auto";

/// Default voice per language; languages without one use the model default
pub const TTS_VOICES: &[(&str, &str)] = &[("zh", "Vivian"), ("en", "Chelsie")];

pub fn tts_language(code: &str) -> &'static str {
    TTS_LANGUAGES
        .iter()
        .find(|(c, _)| *c == code)
        .map(|(_, name)| *name)
        .unwrap_or(TTS_AUTO_LANGUAGE)
}

pub fn tts_voice(code: &str) -> Option<&'static str> {
    TTS_VOICES
        .iter()
        .find(|(c, _)| *c == code)
        .map(|(_, voice)| *voice)
}

pub fn tts_supports_language(code: &str) -> bool {
    TTS_LANGUAGES.iter().any(|(c, _)| *c == code)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_catalog_ids_unique() {
        for (i, a) in TRANSLATION_MODELS.iter().enumerate() {
            for b in &TRANSLATION_MODELS[i + 1..] {
                assert_ne!(a.id, b.id);
            }
        }
        assert_eq!(find_translation_model("4b").map(|m| m.ram_gb), Some(4));
        assert!(find_translation_model("70b").is_none());
    }

    #[test]
    fn test_language_lookup() {
        assert_eq!(language_name("es"), Some("Spanish"));
        assert_eq!(language_name("xx"), None);
    }

    #[test]
    fn test_tts_tables() {
        assert_eq!(tts_language("ja"), "Japanese");
        assert_eq!(tts_language("nl"), TTS_AUTO_LANGUAGE);
        assert_eq!(tts_voice("en"), Some("Chelsie"));
        assert_eq!(tts_voice("de"), None);
        assert!(tts_supports_language("zh"));
        assert!(!tts_supports_language("nl"));
    }
}
