//! Program arguments block.
//!
//! The booted program finds its `argv` at [`ARGS_ADDRESS`]: the `ARGv` tag,
//! each argument NUL-terminated, one extra NUL, zero padding to 1 KiB.
//!
//! [`ARGS_ADDRESS`]: crate::protocol::ARGS_ADDRESS

use crate::error::{Error, Result};
use crate::protocol::{ARGS_BLOCK_SIZE, ARGS_MAGIC, ARGS_MAX_ITEMS, ARGS_MAX_PAYLOAD};

/// Encode `args` into a full-size arguments block.
pub fn build_block<S: AsRef<str>>(args: &[S]) -> Result<Vec<u8>> {
    if args.len() > ARGS_MAX_ITEMS {
        return Err(Error::InvalidArguments(format!(
            "{} arguments given, at most {ARGS_MAX_ITEMS} fit",
            args.len()
        )));
    }

    let mut block = Vec::with_capacity(ARGS_BLOCK_SIZE);
    block.extend_from_slice(ARGS_MAGIC);
    for arg in args {
        let arg = arg.as_ref();
        if arg.as_bytes().contains(&0) {
            return Err(Error::InvalidArguments(format!(
                "argument {arg:?} contains a NUL byte"
            )));
        }
        block.extend_from_slice(arg.as_bytes());
        block.push(0);
    }
    block.push(0);

    let payload = block.len() - ARGS_MAGIC.len();
    if payload > ARGS_MAX_PAYLOAD {
        return Err(Error::InvalidArguments(format!(
            "arguments need {payload} bytes, at most {ARGS_MAX_PAYLOAD} fit"
        )));
    }
    block.resize(ARGS_BLOCK_SIZE, 0);
    Ok(block)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_layout() {
        let block = build_block(&["prog", "-v"]).unwrap();
        assert_eq!(block.len(), ARGS_BLOCK_SIZE);
        assert_eq!(&block[..4], b"ARGv");
        assert_eq!(&block[4..13], b"prog\0-v\0\0");
        assert!(block[13..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_too_many_items() {
        let args = vec!["x"; ARGS_MAX_ITEMS + 1];
        assert!(matches!(
            build_block(&args),
            Err(Error::InvalidArguments(_))
        ));
    }

    #[test]
    fn test_payload_limit() {
        // 1018 bytes + NUL + final NUL = 1020, exactly full
        let fits = "a".repeat(ARGS_MAX_PAYLOAD - 2);
        assert!(build_block(&[fits.as_str()]).is_ok());

        let too_long = "a".repeat(ARGS_MAX_PAYLOAD - 1);
        assert!(build_block(&[too_long.as_str()]).is_err());
    }
}
