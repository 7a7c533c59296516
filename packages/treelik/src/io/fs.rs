use eyre::{Report, WrapErr};
use std::fs;
use std::path::Path;

pub fn filename_maybe(filepath: impl AsRef<Path>) -> Option<String> {
  filepath.as_ref().file_name()?.to_str()?.to_owned().into()
}

pub fn read_file_to_string(filepath: impl AsRef<Path>) -> Result<String, Report> {
  let filepath = filepath.as_ref();
  fs::read_to_string(filepath).wrap_err_with(|| format!("When reading file: '{}'", filepath.display()))
}
