/// One element of a key sequence written in `{NAME}` notation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyToken {
    Text(String),
    Enter,
    Escape,
    Tab,
    Backspace,
    Delete,
    /// `^x`: Ctrl + character.
    Ctrl(char),
    /// `%x`: Alt + character.
    Alt(char),
}

impl KeyToken {
    /// WebDriver code point for special keys (W3C WebDriver, "keys" table).
    pub fn webdriver_code(&self) -> Option<char> {
        match self {
            KeyToken::Enter => Some('\u{E007}'),
            KeyToken::Escape => Some('\u{E00C}'),
            KeyToken::Tab => Some('\u{E004}'),
            KeyToken::Backspace => Some('\u{E003}'),
            KeyToken::Delete => Some('\u{E017}'),
            _ => None,
        }
    }
}

/// Parses `"{ENTER}"`, `"^p"`, `"abc{TAB}def"` and similar sequences.
/// Unknown `{...}` groups are kept as literal text.
pub fn parse_keys(keys: &str) -> Vec<KeyToken> {
    let mut tokens = Vec::new();
    let mut text = String::new();
    let mut chars = keys.chars().peekable();

    let flush = |text: &mut String, tokens: &mut Vec<KeyToken>| {
        if !text.is_empty() {
            tokens.push(KeyToken::Text(std::mem::take(text)));
        }
    };

    while let Some(c) = chars.next() {
        match c {
            '{' => {
                let mut name = String::new();
                let mut closed = false;
                for n in chars.by_ref() {
                    if n == '}' {
                        closed = true;
                        break;
                    }
                    name.push(n);
                }
                let special = match name.to_ascii_uppercase().as_str() {
                    "ENTER" => Some(KeyToken::Enter),
                    "ESC" | "ESCAPE" => Some(KeyToken::Escape),
                    "TAB" => Some(KeyToken::Tab),
                    "BACKSPACE" | "BS" => Some(KeyToken::Backspace),
                    "DEL" | "DELETE" => Some(KeyToken::Delete),
                    _ => None,
                };
                match special {
                    Some(token) if closed => {
                        flush(&mut text, &mut tokens);
                        tokens.push(token);
                    }
                    _ => {
                        text.push('{');
                        text.push_str(&name);
                        if closed {
                            text.push('}');
                        }
                    }
                }
            }
            '^' | '%' => match chars.next() {
                Some(key) => {
                    flush(&mut text, &mut tokens);
                    tokens.push(if c == '^' {
                        KeyToken::Ctrl(key)
                    } else {
                        KeyToken::Alt(key)
                    });
                }
                None => text.push(c),
            },
            other => text.push(other),
        }
    }
    flush(&mut text, &mut tokens);
    tokens
}
