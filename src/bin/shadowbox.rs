fn main() {
    shadowbox::cli::run();
}
