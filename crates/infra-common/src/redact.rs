//! Masking of caller identifiers before they reach the logs

/// Mask a phone number, keeping only the last four characters
pub fn mask_phone(phone: &str) -> String {
    let chars: Vec<char> = phone.chars().collect();
    if chars.len() <= 4 {
        return "****".to_string();
    }
    let visible: String = chars[chars.len() - 4..].iter().collect();
    format!("{}{}", "*".repeat(chars.len() - 4), visible)
}

/// Mask the local part of an email address after its first character
pub fn mask_email(email: &str) -> String {
    match email.split_once('@') {
        Some((user, domain)) if !user.is_empty() => {
            let mut chars = user.chars();
            let first = chars.next().map(String::from).unwrap_or_default();
            format!("{}{}@{}", first, "*".repeat(chars.count()), domain)
        }
        _ => "***@***".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mask_phone() {
        assert_eq!(mask_phone("+919876543210"), "*********3210");
        assert_eq!(mask_phone("1234"), "****");
        assert_eq!(mask_phone(""), "****");
    }

    #[test]
    fn test_mask_email() {
        assert_eq!(mask_email("sharma@gmail.com"), "s*****@gmail.com");
        assert_eq!(mask_email("@nobody"), "***@***");
        assert_eq!(mask_email("plain"), "***@***");
    }
}
