// This is a metapackage for tests
// Cross-crate settlement flows live under tests/
