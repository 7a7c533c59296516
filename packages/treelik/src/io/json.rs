use crate::io::fs::read_file_to_string;
use eyre::{Report, WrapErr};
use serde::{Deserialize, Serialize};
use std::path::Path;

pub fn json_read_file<T: for<'de> Deserialize<'de>, P: AsRef<Path>>(filepath: P) -> Result<T, Report> {
  let filepath = filepath.as_ref();
  let content = read_file_to_string(filepath)?;
  json_read_str(content).wrap_err_with(|| format!("When reading JSON file: '{}'", filepath.display()))
}

pub fn json_read_str<T: for<'de> Deserialize<'de>>(s: impl AsRef<str>) -> Result<T, Report> {
  serde_json::from_str(s.as_ref()).wrap_err("When reading JSON string")
}

#[derive(Clone, Copy, Debug)]
pub struct JsonPretty(pub bool);

pub fn json_write_str<T: Serialize>(obj: &T, pretty: JsonPretty) -> Result<String, Report> {
  if pretty.0 {
    serde_json::to_string_pretty(obj)
  } else {
    serde_json::to_string(obj)
  }
  .wrap_err("When writing JSON string")
}
