//! Terminal colors for command output. `NO_COLOR` turns them off.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tone {
    Good,
    Caution,
    Bad,
    Note,
    Muted,
    Strong,
}

impl Tone {
    fn code(self) -> &'static str {
        match self {
            Self::Good => "32",
            Self::Caution => "33",
            Self::Bad => "31",
            Self::Note => "36",
            Self::Muted => "2",
            Self::Strong => "1",
        }
    }
}

fn enabled() -> bool {
    std::env::var_os("NO_COLOR").is_none_or(|v| v.is_empty())
}

pub fn paint(tone: Tone, text: impl std::fmt::Display) -> String {
    if enabled() {
        format!("\x1b[{}m{text}\x1b[0m", tone.code())
    } else {
        text.to_string()
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn painted_text_keeps_its_content() {
        let painted = paint(Tone::Bad, "stale");
        assert!(painted.contains("stale"));
        if enabled() {
            assert!(painted.starts_with("\x1b[31m"));
            assert!(painted.ends_with("\x1b[0m"));
        }
    }
}
