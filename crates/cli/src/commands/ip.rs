//! Address conversion CLI commands

use anyhow::Result;
use migration_lib::token::{int_to_ipv4, ipv4_str_to_int};
use serde::Serialize;

use crate::output::{print_json, OutputFormat};

#[derive(Debug, PartialEq, Eq, Serialize)]
struct Conversion {
    literal: String,
    integer: u32,
}

fn convert_literal(literal: &str) -> Result<Conversion> {
    let integer = ipv4_str_to_int(literal)?;
    Ok(Conversion {
        literal: literal.to_string(),
        integer,
    })
}

fn convert_integer(value: i64) -> Result<Conversion> {
    let addr = int_to_ipv4(value)?;
    Ok(Conversion {
        literal: addr.to_string(),
        integer: u32::from(addr),
    })
}

fn print(conversion: &Conversion, show_integer: bool, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => print_json(conversion)?,
        OutputFormat::Table if show_integer => println!("{}", conversion.integer),
        OutputFormat::Table => println!("{}", conversion.literal),
    }
    Ok(())
}

pub fn to_int(literal: &str, format: OutputFormat) -> Result<()> {
    print(&convert_literal(literal)?, true, format)
}

pub fn to_str(value: i64, format: OutputFormat) -> Result<()> {
    print(&convert_integer(value)?, false, format)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_convert_literal() {
        let conversion = convert_literal("10.0.0.1").unwrap();
        assert_eq!(conversion.integer, 167_772_161);
    }

    #[test]
    fn test_convert_integer() {
        let conversion = convert_integer(3_232_235_777).unwrap();
        assert_eq!(conversion.literal, "192.168.1.1");
        assert_eq!(conversion.integer, 3_232_235_777);
    }

    #[test]
    fn test_rejects_bad_input() {
        assert!(convert_literal("10.0.0").is_err());
        assert!(convert_literal("256.0.0.1").is_err());
        assert!(convert_integer(-1).is_err());
        assert!(convert_integer(1 << 32).is_err());
    }
}
