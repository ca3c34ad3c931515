//! In-game text color escapes.
//!
//! The engine renders `\f<digit>` sequences as color changes. These helpers
//! wrap a string in the escape for the conventional palette slots.

const ESCAPE: char = '\u{c}';

fn colored(slot: u8, text: &str) -> String {
    format!("{ESCAPE}{slot}{text}")
}

pub fn green(text: &str) -> String {
    colored(0, text)
}

pub fn blue(text: &str) -> String {
    colored(1, text)
}

pub fn yellow(text: &str) -> String {
    colored(2, text)
}

pub fn red(text: &str) -> String {
    colored(3, text)
}

pub fn gray(text: &str) -> String {
    colored(4, text)
}

pub fn magenta(text: &str) -> String {
    colored(5, text)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escapes_prefix_the_text() {
        assert_eq!(red("oops"), "\u{c}3oops");
        assert_eq!(green("ok"), "\u{c}0ok");
    }
}
