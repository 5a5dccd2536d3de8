mod impute_tests;
mod parse_tests;
