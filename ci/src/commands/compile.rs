use argh::FromArgs;

use crate::commands::{CompileCheckCommand, DocTestCommand};
use crate::Flag;
use crate::Prepare;
use crate::PreparedCommand;

/// Alias for running the `compile-check` and `doc-test` subcommands. The doc
/// tests include the compile failure tests.
#[derive(FromArgs, Default)]
#[argh(subcommand, name = "compile")]
pub struct CompileCommand {}

impl Prepare for CompileCommand {
    fn prepare<'a>(&self, sh: &'a xshell::Shell, flags: Flag) -> Vec<PreparedCommand<'a>> {
        let mut commands = vec![];
        commands.append(&mut CompileCheckCommand::default().prepare(sh, flags));
        commands.append(&mut DocTestCommand::default().prepare(sh, flags));
        commands
    }
}
