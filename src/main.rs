fn main() {
    keysweep::run();
}
