//! Order-preserving INI document used for `GPT.INI` markers.
//!
//! Lookups ignore ASCII case for both section and key names. Rendering
//! writes `key=value` without padding, which is how domain controllers
//! write these files.

use std::fmt;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IniDocument {
    sections: Vec<Section>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Section {
    /// Empty for keys that appear before any `[section]` header.
    name: String,
    entries: Vec<(String, String)>,
}

impl Section {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            entries: Vec::new(),
        }
    }

    fn set(&mut self, key: &str, value: &str) {
        match self
            .entries
            .iter_mut()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
        {
            Some(entry) => entry.1 = value.to_owned(),
            None => self.entries.push((key.to_owned(), value.to_owned())),
        }
    }
}

impl IniDocument {
    /// Parse a document. Unrecognised lines and comments are dropped; this
    /// never fails.
    pub fn parse(text: &str) -> Self {
        let text = text.strip_prefix('\u{feff}').unwrap_or(text);
        let mut doc = Self::default();
        let mut current: Option<usize> = None;

        for raw in text.lines() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with(';') || line.starts_with('#') {
                continue;
            }
            if let Some(name) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
                current = Some(doc.section_index(name.trim()));
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            let key = key.trim();
            if key.is_empty() {
                continue;
            }
            let index = match current {
                Some(index) => index,
                None => {
                    let index = doc.section_index("");
                    current = Some(index);
                    index
                }
            };
            doc.sections[index].set(key, value.trim());
        }
        doc
    }

    pub fn get(&self, section: &str, key: &str) -> Option<&str> {
        self.sections
            .iter()
            .find(|s| s.name.eq_ignore_ascii_case(section))?
            .entries
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }

    /// Set `key` in `section`, creating either if absent. Existing spelling
    /// of section and key names is kept.
    pub fn set(&mut self, section: &str, key: &str, value: &str) {
        let index = self.section_index(section);
        self.sections[index].set(key, value);
    }

    fn section_index(&mut self, name: &str) -> usize {
        if let Some(index) = self
            .sections
            .iter()
            .position(|s| s.name.eq_ignore_ascii_case(name))
        {
            return index;
        }
        // Header-less keys always render first.
        if name.is_empty() {
            self.sections.insert(0, Section::new(name));
            return 0;
        }
        self.sections.push(Section::new(name));
        self.sections.len() - 1
    }
}

impl fmt::Display for IniDocument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for section in &self.sections {
            if !section.name.is_empty() {
                writeln!(f, "[{}]", section.name)?;
            }
            for (key, value) in &section.entries {
                writeln!(f, "{key}={value}")?;
            }
        }
        Ok(())
    }
}
