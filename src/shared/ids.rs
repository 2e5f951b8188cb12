use getrandom::getrandom;

const BASE36_ALPHABET: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";
const SUFFIX_SPACE: u32 = 36 * 36 * 36 * 36;

/// Generates a compact, sortable task id of the form `task-<ts36>-<rand36>`.
/// The timestamp prefix keeps ids roughly chronological; the random suffix
/// disambiguates tasks created within the same second.
pub fn generate_task_id(now: i64) -> Result<String, String> {
    let timestamp = u64::try_from(now)
        .map_err(|_| "task id generation requires a non-negative timestamp".to_string())?;
    let mut bytes = [0_u8; 4];
    getrandom(&mut bytes)
        .map_err(|err| format!("task id randomness unavailable: {err}"))?;
    let sample = u32::from_le_bytes(bytes) % SUFFIX_SPACE;
    Ok(format!(
        "task-{}-{}",
        base36_encode_u64(timestamp),
        base36_encode_fixed_u32(sample, 4)
    ))
}

/// Collapses a remote sender identity into a filesystem-safe key. Mirrors the
/// queue filename rules: alphanumerics, `-`, `_` and `.` pass through,
/// everything else becomes `_`.
pub fn sender_key(sender_id: &str) -> String {
    let key: String = sender_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if key.is_empty() {
        "unknown".to_string()
    } else {
        key
    }
}

fn base36_encode_u64(mut value: u64) -> String {
    if value == 0 {
        return "0".to_string();
    }
    let mut out = Vec::new();
    while value > 0 {
        out.push(BASE36_ALPHABET[(value % 36) as usize] as char);
        value /= 36;
    }
    out.into_iter().rev().collect()
}

fn base36_encode_fixed_u32(mut value: u32, width: usize) -> String {
    let mut chars = vec!['0'; width];
    for idx in (0..width).rev() {
        chars[idx] = BASE36_ALPHABET[(value % 36) as usize] as char;
        value /= 36;
    }
    chars.into_iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_ids_carry_prefix_and_are_unique() {
        let a = generate_task_id(1_700_000_000).expect("id a");
        let b = generate_task_id(1_700_000_000).expect("id b");
        assert!(a.starts_with("task-"));
        assert_ne!(a, b);
    }

    #[test]
    fn task_id_rejects_negative_timestamp() {
        assert!(generate_task_id(-1).is_err());
    }

    #[test]
    fn sender_key_masks_wire_characters() {
        assert_eq!(sender_key("4915551234@s.net"), "4915551234_s.net");
        assert_eq!(sender_key(""), "unknown");
        assert_eq!(sender_key("user_1"), "user_1");
    }
}
