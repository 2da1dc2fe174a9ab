use std::io::Write;

/// Formats a byte count into a human-readable string (B, KiB, MiB, GiB).
#[allow(clippy::cast_precision_loss)]
pub fn format_size(bytes: u64) -> String {
    const KIB: u64 = 1024;
    const MIB: u64 = 1024 * KIB;
    const GIB: u64 = 1024 * MIB;

    if bytes >= GIB {
        format!("{:.2} GiB", bytes as f64 / GIB as f64)
    } else if bytes >= MIB {
        format!("{:.2} MiB", bytes as f64 / MIB as f64)
    } else if bytes >= KIB {
        format!("{:.2} KiB", bytes as f64 / KIB as f64)
    } else {
        format!("{bytes} B")
    }
}

/// Redraws the in-place progress line.
#[allow(clippy::cast_possible_truncation, clippy::cast_precision_loss)]
pub fn print_progress(transferred: u64, total: u64) {
    let pct = if total == 0 {
        100
    } else {
        ((transferred as f64 / total as f64) * 100.0) as u64
    };
    print!(
        "\r  {pct:>3}%  {} / {}",
        format_size(transferred),
        format_size(total)
    );
    let _ = std::io::stdout().flush();
}

/// Reads one trimmed line from the given buffered stdin reader.
/// Returns `None` on EOF or read error.
pub async fn read_line(reader: &mut tokio::io::BufReader<tokio::io::Stdin>) -> Option<String> {
    use tokio::io::AsyncBufReadExt;

    let mut line = String::new();
    match reader.read_line(&mut line).await {
        Ok(0) | Err(_) => None,
        Ok(_) => Some(line.trim().to_string()),
    }
}

/// Asks the user to accept or deny an offer. EOF counts as a deny.
pub async fn confirm_offer(
    reader: &mut tokio::io::BufReader<tokio::io::Stdin>,
    file_name: &str,
    file_size: u64,
) -> bool {
    loop {
        print!(
            "  Accept \"{file_name}\" ({})? [y/n] ",
            format_size(file_size)
        );
        let _ = std::io::stdout().flush();
        match read_line(reader).await.as_deref() {
            Some("y" | "yes" | "Y") => return true,
            Some("n" | "no" | "N") | None => return false,
            Some(_) => println!("  Please answer y or n."),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn when_formatting_sizes_expect_sensible_units() {
        assert_eq!(format_size(0), "0 B");
        assert_eq!(format_size(1023), "1023 B");
        assert_eq!(format_size(1024), "1.00 KiB");
        assert_eq!(format_size(1024 * 1024), "1.00 MiB");
        assert_eq!(format_size(5 * 1024 * 1024 * 1024), "5.00 GiB");
    }
}
