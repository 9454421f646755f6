// #![warn(
//     clippy::all,
//     clippy::pedantic,
// )]
// //some lints are really just too pedantic
// #![allow(clippy::must_use_candidate)]
// #![allow(clippy::module_name_repetitions)]

pub mod array;
pub mod io;
pub mod numerical;
pub mod vector;
