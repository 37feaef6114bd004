use regex::Regex;

/// Insertion-ordered placeholder → original-code map for one extraction.
pub type PlaceholderMap = Vec<(String, String)>;

/// Swaps code spans for stable placeholders so a translator cannot corrupt
/// them, and swaps them back afterwards.
///
/// Fenced blocks are extracted first, then inline back-tick spans on the
/// result; one counter numbers both kinds.
pub struct CodeGuard {
    fenced: Regex,
    inline: Regex,
    placeholder: Regex,
}

impl Default for CodeGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl CodeGuard {
    pub fn new() -> Self {
        Self {
            fenced: Regex::new(r"```[\s\S]*?```").unwrap(),
            inline: Regex::new(r"`[^`]+`").unwrap(),
            placeholder: Regex::new(r"__(?:CODE_BLOCK|INLINE_CODE)_\d+__").unwrap(),
        }
    }

    /// Replace code spans with placeholders, returning the cleaned text and
    /// the map needed to restore it.
    pub fn extract(&self, text: &str) -> (String, PlaceholderMap) {
        if text.is_empty() {
            return (String::new(), Vec::new());
        }

        let mut placeholders: PlaceholderMap = Vec::new();
        let mut index = 0usize;

        let after_fenced = self.fenced.replace_all(text, |caps: &regex::Captures<'_>| {
            let token = format!("__CODE_BLOCK_{index}__");
            placeholders.push((token.clone(), caps[0].to_string()));
            index += 1;
            token
        });
        let clean = self
            .inline
            .replace_all(&after_fenced, |caps: &regex::Captures<'_>| {
                let token = format!("__INLINE_CODE_{index}__");
                placeholders.push((token.clone(), caps[0].to_string()));
                index += 1;
                token
            })
            .into_owned();

        (clean, placeholders)
    }

    /// Substitute placeholders back. Split-and-join handles a translator
    /// echoing a placeholder more than once.
    pub fn restore(&self, translated: &str, placeholders: &PlaceholderMap) -> String {
        let mut text = translated.to_string();
        for (token, original) in placeholders {
            if text.contains(token.as_str()) {
                text = text
                    .split(token.as_str())
                    .collect::<Vec<_>>()
                    .join(original);
            }
        }
        text
    }

    /// True when nothing but code (and whitespace) remains after extraction.
    pub fn is_code_only(&self, text: &str) -> bool {
        if text.is_empty() {
            return false;
        }
        let (clean, placeholders) = self.extract(text);
        !placeholders.is_empty() && self.nothing_translatable(&clean)
    }

    /// True when already-extracted text holds only placeholders and
    /// whitespace, i.e. there is nothing left for a translator to do.
    pub fn nothing_translatable(&self, clean: &str) -> bool {
        self.placeholder.replace_all(clean, "").trim().is_empty()
    }

    /// Count (fenced, inline) code spans. Fenced content is subtracted
    /// before counting inline so back-ticks inside fences are not counted
    /// twice.
    pub fn count_code_blocks(&self, text: &str) -> (usize, usize) {
        if text.is_empty() {
            return (0, 0);
        }
        let fenced = self.fenced.find_iter(text).count();
        let without_fenced = self.fenced.replace_all(text, "");
        let inline = self.inline.find_iter(&without_fenced).count();
        (fenced, inline)
    }
}
