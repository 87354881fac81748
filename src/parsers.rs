// SPDX-License-Identifier: LGPL-2.1-or-later

use std::{fs::File, io::Read, str::FromStr};

use color_print::cformat;
use num_traits::Num;

#[allow(dead_code, reason = "shared between the library and CLI crate roots")]
pub fn parse_number<T: Num + FromStr>(s: &str) -> Result<T, String> {
    match s.strip_prefix("0x") {
        Some(stripped) => {
            T::from_str_radix(stripped, 16).or(Err(cformat!("hex number '<y>{s}</>' is invalid or too large")))
        }
        None => s
            .parse()
            .or(Err(cformat!("number '<y>{s}</>' is invalid or too large!"))),
    }
}

#[allow(dead_code, reason = "shared between the library and CLI crate roots")]
pub fn parse_file(s: &str, limit: Option<usize>) -> Result<Box<[u8]>, String> {
    let mut file = File::open(s).map_err(|err| err.to_string())?;
    Ok(if let Some(limit) = limit {
        let mut buf = vec![0u8; limit];
        file.read_exact(&mut buf).map_err(|err| err.to_string())?;
        buf
    } else {
        let mut buf = Vec::new();
        file.read_to_end(&mut buf).map_err(|err| err.to_string())?;
        buf
    }
    .into_boxed_slice())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_number() {
        assert_eq!(parse_number::<u32>("42").unwrap(), 42);
        assert_eq!(parse_number::<u32>("0x2000").unwrap(), 0x2000);
        assert!(parse_number::<u8>("0x1FF").is_err());
        assert!(parse_number::<u32>("junk").is_err());
    }
}
