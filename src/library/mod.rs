//! Function libraries installable from a makefile with `$(python-mod ...)`

pub mod strings;
