//! Entity id generation
//!
//! Ids are opaque 36-char strings (UUID v7 text form). v7 keeps ids
//! roughly time-ordered, which makes execution listings and store scans
//! cheap to reason about.

use uuid::Uuid;

/// Generate a fresh entity id
pub fn new_id() -> String {
    Uuid::now_v7().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_is_36_chars() {
        assert_eq!(new_id().len(), 36);
    }

    #[test]
    fn test_ids_unique() {
        let a = new_id();
        let b = new_id();
        assert_ne!(a, b);
    }

    #[test]
    fn test_ids_time_ordered() {
        let a = new_id();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let b = new_id();
        assert!(b > a);
    }
}
