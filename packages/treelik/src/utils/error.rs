#![allow(clippy::pub_use)]

use color_eyre::Report;
use std::any::Any;

pub fn report_to_string(report: &Report) -> String {
  let strings: Vec<String> = report.chain().map(std::string::ToString::to_string).collect();
  strings.join(": ")
}

/// Extracts a human-readable message from a panic payload caught with `catch_unwind`
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
  if let Some(s) = payload.downcast_ref::<&str>() {
    (*s).to_owned()
  } else if let Some(s) = payload.downcast_ref::<String>() {
    s.clone()
  } else {
    "unknown panic payload".to_owned()
  }
}

#[macro_export(local_inner_macros)]
macro_rules! make_error {
  ($($arg:tt)*) => {
    {
      Err(eyre::eyre!(std::format!($($arg)*)))
    }
  };
}

pub use make_error;

#[macro_export(local_inner_macros)]
macro_rules! make_report {
  ($($arg:tt)*) => {
    {
      eyre::eyre!($($arg)*)
    }
  };
}

pub use make_report;

#[macro_export(local_inner_macros)]
macro_rules! make_internal_error {
  ($($arg:tt)*) => {
    {
      let msg_external = std::format!($($arg)*);
      let msg = std::format!("{msg_external}. This is an internal error. Please report it to developers.");
      Err(eyre::eyre!(msg))
    }
  };
}

pub use make_internal_error;

#[macro_export(local_inner_macros)]
macro_rules! make_internal_report {
  ($($arg:tt)*) => {
    {
      let msg_external = std::format!($($arg)*);
      let msg = std::format!("{msg_external}. This is an internal error. Please report it to developers.");
      eyre::eyre!(msg)
    }
  };
}

pub use make_internal_report;
