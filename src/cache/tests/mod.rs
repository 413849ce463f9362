mod tests_arc;
mod tests_basic;
