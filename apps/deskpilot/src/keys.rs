use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Key {
    Control,
    Shift,
    Alt,
    Meta,
    Enter,
    Backspace,
    Delete,
    Tab,
    Space,
    Escape,
    Left,
    Right,
    Up,
    Down,
    Home,
    End,
    PageUp,
    PageDown,
    Function(u8),
    Char(char),
}

impl Key {
    pub fn is_modifier(self) -> bool {
        matches!(self, Key::Control | Key::Shift | Key::Alt | Key::Meta)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum KeyError {
    #[error("unknown key `{0}`")]
    Unknown(String),
    #[error("empty key combination")]
    Empty,
}

/// Modifiers held while `keys` are clicked in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyCombo {
    pub modifiers: Vec<Key>,
    pub keys: Vec<Key>,
}

impl KeyCombo {
    pub fn parse<S: AsRef<str>>(names: &[S]) -> Result<Self, KeyError> {
        let mut modifiers = Vec::new();
        let mut keys = Vec::new();
        for name in names {
            let key = parse_key(name.as_ref())?;
            if key.is_modifier() {
                modifiers.push(key);
            } else {
                keys.push(key);
            }
        }
        // A lone modifier ("shift") is a key tap of its own.
        if keys.is_empty() {
            keys.push(modifiers.pop().ok_or(KeyError::Empty)?);
        }
        Ok(Self { modifiers, keys })
    }
}

pub fn parse_key(name: &str) -> Result<Key, KeyError> {
    let trimmed = name.trim();
    let mut chars = trimmed.chars();
    if let (Some(ch), None) = (chars.next(), chars.next()) {
        return Ok(if ch == ' ' { Key::Space } else { Key::Char(ch) });
    }
    let lowered = trimmed.to_ascii_lowercase();
    let key = match lowered.as_str() {
        "control" | "ctrl" => Key::Control,
        "shift" => Key::Shift,
        "alt" | "option" => Key::Alt,
        "meta" | "command" | "cmd" | "super" | "win" => Key::Meta,
        "enter" | "return" => Key::Enter,
        "backspace" => Key::Backspace,
        "delete" | "del" => Key::Delete,
        "tab" => Key::Tab,
        "space" => Key::Space,
        "escape" | "esc" => Key::Escape,
        "left" | "arrowleft" => Key::Left,
        "right" | "arrowright" => Key::Right,
        "up" | "arrowup" => Key::Up,
        "down" | "arrowdown" => Key::Down,
        "home" => Key::Home,
        "end" => Key::End,
        "pageup" | "page_up" => Key::PageUp,
        "pagedown" | "page_down" => Key::PageDown,
        "" => return Err(KeyError::Empty),
        other => match other.strip_prefix('f').and_then(|n| n.parse::<u8>().ok()) {
            Some(n @ 1..=24) => Key::Function(n),
            _ => return Err(KeyError::Unknown(trimmed.to_string())),
        },
    };
    Ok(key)
}

/// Splits `"ctrl+shift+t"` style chords. A trailing `+` names the plus key.
pub fn split_combo(text: &str) -> Vec<String> {
    let trimmed = text.trim();
    if trimmed == "+" {
        return vec!["+".to_string()];
    }
    let mut parts: Vec<String> = trimmed
        .split('+')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(str::to_string)
        .collect();
    if trimmed.ends_with("++") {
        parts.push("+".to_string());
    }
    parts
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn modifier_aliases_are_normalized() {
        for (name, key) in [
            ("Control", Key::Control),
            ("ctrl", Key::Control),
            ("Option", Key::Alt),
            ("Command", Key::Meta),
            ("Super", Key::Meta),
            ("Return", Key::Enter),
            ("ArrowLeft", Key::Left),
            ("esc", Key::Escape),
            ("F5", Key::Function(5)),
        ] {
            assert_eq!(parse_key(name), Ok(key), "{name}");
        }
        assert_eq!(parse_key("a"), Ok(Key::Char('a')));
        assert_eq!(parse_key("hyper"), Err(KeyError::Unknown("hyper".into())));
    }

    #[test]
    fn combo_separates_modifiers_from_keys() {
        let combo = KeyCombo::parse(&["Control", "Shift", "t"]).unwrap();
        assert_eq!(combo.modifiers, vec![Key::Control, Key::Shift]);
        assert_eq!(combo.keys, vec![Key::Char('t')]);

        let lone = KeyCombo::parse(&["shift"]).unwrap();
        assert!(lone.modifiers.is_empty());
        assert_eq!(lone.keys, vec![Key::Shift]);

        assert_eq!(KeyCombo::parse::<&str>(&[]), Err(KeyError::Empty));
    }

    #[test]
    fn chords_split_on_plus() {
        assert_eq!(split_combo("ctrl+c"), vec!["ctrl", "c"]);
        assert_eq!(split_combo(" Control + Shift + T "), vec!["Control", "Shift", "T"]);
        assert_eq!(split_combo("ctrl++"), vec!["ctrl", "+"]);
        assert_eq!(split_combo("enter"), vec!["enter"]);
    }
}
