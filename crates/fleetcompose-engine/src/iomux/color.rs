//! 行プレフィックスの色付け

use colored::{Color, Colorize};

const PALETTE: [Color; 5] = [
    Color::Cyan,
    Color::Green,
    Color::Yellow,
    Color::Magenta,
    Color::Blue,
];

/// ソース名から `name  | ` 形式のプレフィックスを作る
///
/// 色はソースの並び順で決まり、同じ呼び出しの中では変わらない。
#[derive(Debug, Clone)]
pub struct Prefixer {
    width: usize,
    no_color: bool,
}

impl Prefixer {
    pub fn new<'a>(names: impl IntoIterator<Item = &'a str>, no_color: bool) -> Self {
        let width = names.into_iter().map(|n| n.chars().count()).max().unwrap_or(0);
        Self { width, no_color }
    }

    pub fn prefix(&self, name: &str, index: usize) -> String {
        let padded = format!("{:<width$}  |", name, width = self.width);
        if self.no_color {
            format!("{} ", padded)
        } else {
            format!("{} ", padded.color(PALETTE[index % PALETTE.len()]))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefix_padding() {
        let prefixer = Prefixer::new(["web", "db", "worker"], true);
        assert_eq!(prefixer.prefix("web", 0), "web     | ");
        assert_eq!(prefixer.prefix("worker", 2), "worker  | ");
    }

    #[test]
    fn test_single_source() {
        let prefixer = Prefixer::new(["web"], true);
        assert_eq!(prefixer.prefix("web", 0), "web  | ");
    }

    #[test]
    fn test_color_is_stable_per_index() {
        colored::control::set_override(true);
        let prefixer = Prefixer::new(["web", "db"], false);
        assert_eq!(prefixer.prefix("web", 0), prefixer.prefix("web", 0));
        assert_ne!(prefixer.prefix("web", 0), prefixer.prefix("web", 1));
        colored::control::unset_override();
    }
}
