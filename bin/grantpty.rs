fn main() {
    procpty::grantpty_main()
}
