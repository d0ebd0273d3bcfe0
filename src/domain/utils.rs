pub mod id;
pub mod strutils;
