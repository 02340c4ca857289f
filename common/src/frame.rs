use std::path::Path;

/// File extension of working frame images.
pub const FRAME_EXT: &str = "jpg";

/// Filename for the frame with the given zero-based sequence number,
/// e.g. `frame_000042.jpg`.
///
/// The fixed-width zero padding makes lexicographic filename order equal
/// to numeric sequence order, which the assembler relies on when it
/// enumerates the working directory by pattern instead of tracking the
/// capture run's own counter.
pub fn frame_file_name(seq: u64) -> String {
    format!("frame_{seq:06}.{FRAME_EXT}")
}

/// Whether `path` is a working frame image.
///
/// Matches on extension alone: the working directory is cleared of every
/// `.jpg` before a session starts, so anything left with this extension
/// at encode time belongs to the current session.
pub fn is_frame_file(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext == FRAME_EXT)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn zero_padded_to_six_digits() {
        assert_eq!(frame_file_name(0), "frame_000000.jpg");
        assert_eq!(frame_file_name(42), "frame_000042.jpg");
        assert_eq!(frame_file_name(123456), "frame_123456.jpg");
    }

    #[test]
    fn lexicographic_order_matches_numeric_order() {
        // The classic failure mode without padding: "10" < "9".
        for (a, b) in [(9, 10), (99, 100), (999, 1000), (0, 1)] {
            assert!(
                frame_file_name(a) < frame_file_name(b),
                "frame {a} should sort before frame {b}"
            );
        }
    }

    #[test]
    fn frame_file_predicate() {
        assert!(is_frame_file(&PathBuf::from("work/frame_000001.jpg")));
        assert!(is_frame_file(&PathBuf::from("stale.jpg")));
        assert!(!is_frame_file(&PathBuf::from("work/timelapse.mp4")));
        assert!(!is_frame_file(&PathBuf::from("serial_number.txt")));
        assert!(!is_frame_file(&PathBuf::from("no_extension")));
    }
}
