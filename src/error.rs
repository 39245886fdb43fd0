use thiserror::Error;

/// Failures raised by the background/foreground core.
///
/// These are integration errors: by the time frames reach the core they are
/// expected to be normalized, so nothing here is retried or recovered.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CoreError {
    #[error("cannot estimate a background from an empty frame sequence")]
    EmptySequence,

    #[error("{}", mismatch_message(.index, .expected, .actual))]
    DimensionMismatch {
        index: Option<usize>,
        expected: (u32, u32),
        actual: (u32, u32),
    },

    #[error("invalid configuration: {0}")]
    Configuration(String),
}

fn mismatch_message(index: &Option<usize>, expected: &(u32, u32), actual: &(u32, u32)) -> String {
    let subject = match index {
        Some(i) => format!("frame {}", i),
        None => "frame".to_string(),
    };
    format!(
        "{} has mismatched dimensions: expected {}x{}, got {}x{}",
        subject, expected.0, expected.1, actual.0, actual.1
    )
}

impl CoreError {
    pub(crate) fn mismatch(index: Option<usize>, expected: (u32, u32), actual: (u32, u32)) -> Self {
        CoreError::DimensionMismatch { index, expected, actual }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_sequence_message() {
        assert_eq!(
            CoreError::EmptySequence.to_string(),
            "cannot estimate a background from an empty frame sequence"
        );
    }

    #[test]
    fn test_dimension_mismatch_message() {
        let err = CoreError::mismatch(Some(3), (427, 240), (640, 480));
        assert_eq!(err.to_string(), "frame 3 has mismatched dimensions: expected 427x240, got 640x480");

        let err = CoreError::mismatch(None, (4, 4), (4, 5));
        assert_eq!(err.to_string(), "frame has mismatched dimensions: expected 4x4, got 4x5");
    }
}
