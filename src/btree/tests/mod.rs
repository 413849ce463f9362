mod tests_features;
mod tests_structure;
