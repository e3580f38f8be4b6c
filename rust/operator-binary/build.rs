fn main() {
    built::write_built_file().expect("Failed to collect build-time information");
}
