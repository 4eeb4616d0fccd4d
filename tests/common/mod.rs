use assert_cmd::Command;

pub fn telefetch_bin() -> Command {
    #[allow(deprecated)]
    {
        Command::cargo_bin("telefetch").expect("telefetch test binary should build")
    }
}
