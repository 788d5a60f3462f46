//! Morse gestures and authentication challenges
//!
//! The shoe turns taps into dots and dashes. The app picks a challenge word,
//! shows its Morse form, and the device checks what the user tapped.

use rand::seq::SliceRandom;

/// Words the app can ask the user to tap
pub const CHALLENGE_WORDS: [&str; 10] = [
    "HELLO", "WORLD", "MORSE", "TAPES", "SHOES", "BLOCK", "CHAIN", "INPUT", "GUARD", "TRUST",
];

/// Sentinel challenge that asks the device to check the saved gesture
pub const VERIFY_CHALLENGE: &str = "VERIFY";

/// Sentinel challenge used after the device timed the session out
pub const REAUTH_CHALLENGE: &str = "REAUTH";

/// Morse code for one letter
pub fn letter_to_morse(letter: char) -> Option<&'static str> {
    let code = match letter.to_ascii_uppercase() {
        'A' => ".-",
        'B' => "-...",
        'C' => "-.-.",
        'D' => "-..",
        'E' => ".",
        'F' => "..-.",
        'G' => "--.",
        'H' => "....",
        'I' => "..",
        'J' => ".---",
        'K' => "-.-",
        'L' => ".-..",
        'M' => "--",
        'N' => "-.",
        'O' => "---",
        'P' => ".--.",
        'Q' => "--.-",
        'R' => ".-.",
        'S' => "...",
        'T' => "-",
        'U' => "..-",
        'V' => "...-",
        'W' => ".--",
        'X' => "-..-",
        'Y' => "-.--",
        'Z' => "--..",
        _ => return None,
    };
    Some(code)
}

/// Letter codes separated by single spaces; unknown characters map to empty
pub fn word_to_morse(word: &str) -> String {
    word.chars()
        .map(|c| letter_to_morse(c).unwrap_or(""))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Pick a challenge word at random
pub fn random_challenge_word() -> &'static str {
    CHALLENGE_WORDS
        .choose(&mut rand::thread_rng())
        .copied()
        .unwrap_or(CHALLENGE_WORDS[0])
}

/// Challenge sent with `start_auth`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthChallenge {
    /// A word the user must tap
    Word(String),
    /// Check the gesture already saved on the device
    Verify,
    /// Re-authenticate after the device expired the session
    Reauth,
}

impl AuthChallenge {
    pub fn random() -> Self {
        AuthChallenge::Word(random_challenge_word().to_string())
    }

    pub fn as_wire(&self) -> &str {
        match self {
            AuthChallenge::Word(word) => word,
            AuthChallenge::Verify => VERIFY_CHALLENGE,
            AuthChallenge::Reauth => REAUTH_CHALLENGE,
        }
    }

    /// Morse the user is expected to tap, if this challenge is a word
    pub fn expected_morse(&self) -> Option<String> {
        match self {
            AuthChallenge::Word(word) => Some(word_to_morse(word)),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_word_to_morse() {
        assert_eq!(word_to_morse("SOS"), "... --- ...");
        assert_eq!(word_to_morse("hello"), ".... . .-.. .-.. ---");
    }

    #[test]
    fn test_random_challenge_comes_from_list() {
        for _ in 0..20 {
            assert!(CHALLENGE_WORDS.contains(&random_challenge_word()));
        }
    }

    #[test]
    fn test_sentinels() {
        assert_eq!(AuthChallenge::Verify.as_wire(), "VERIFY");
        assert_eq!(AuthChallenge::Reauth.as_wire(), "REAUTH");
        assert_eq!(AuthChallenge::Reauth.expected_morse(), None);
        assert_eq!(
            AuthChallenge::Word("TRUST".to_string()).expected_morse().as_deref(),
            Some("- .-. ..- ... -")
        );
    }
}
