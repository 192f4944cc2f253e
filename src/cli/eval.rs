use anyhow::{anyhow, Context, Result};

use crate::config::Config;

/// show text that should be sourced into the bash shell with eval "$(shellcue init)"
pub fn show_bash_eval_string(config: &Config) -> Result<()> {
    let shell = std::env::var("SHELL").context("Unable to read environment variable SHELL")?;
    if !shell.ends_with("bash") {
        anyhow::bail!(
            "Sorry, shellcue only supports the bash shell. I see from $SHELL you're running from {:?}",
            shell
        );
    }
    let current_exe = std::env::current_exe()
        .context("Unable to get current executable name")?
        .into_os_string()
        .into_string()
        .map_err(|_| anyhow!("Unable to format current executable name as a UTF-8 string"))?;

    // The hook runs from PROMPT_COMMAND, so it must never block the prompt:
    // the log call is backgrounded in a subshell and its output discarded.
    // `history 1` repeats the previous entry when the user just hits enter,
    // so we only log when the history number moves.
    let cmd = r#"if [[ ! -S "@SHELLCUE_SOCKET@" ]]; then
    "@SHELLCUE_EXE@" daemon --daemonize >/dev/null 2>&1
fi
__shellcue_session="@SHELLCUE_HOSTNAME@-$$-$(date +%s)"
__shellcue_histnum=""

__shellcue() {
    local EXIT="$?"
    local entry
    entry=$(HISTTIMEFORMAT= command history 1)
    if [[ "$entry" =~ ^[[:space:]]*([0-9]+)[*]?[[:space:]]+(.*)$ ]]; then
        local num="${BASH_REMATCH[1]}"
        local cmd="${BASH_REMATCH[2]}"
        if [[ -n "$__shellcue_histnum" && "$num" != "$__shellcue_histnum" ]]; then
            ("@SHELLCUE_EXE@" log --exit-code "$EXIT" --cwd "$PWD" --session "$__shellcue_session" -- "$cmd" >/dev/null 2>&1 &)
        fi
        __shellcue_histnum="$num"
    fi
    return $EXIT
}

__shellcue_suggest() {
    local last
    last=$(HISTTIMEFORMAT= command history 1 | sed -E 's/^[[:space:]]*[0-9]+[*]?[[:space:]]+//')
    local suggestion
    suggestion=$("@SHELLCUE_EXE@" suggest --cwd "$PWD" --history "$last" -- "$READLINE_LINE" 2>/dev/null | head -n 1)
    if [[ -n "$suggestion" ]]; then
        READLINE_LINE="$suggestion"
        READLINE_POINT=${#suggestion}
    fi
}
[[ ${SHELLOPTS} =~ (vi|emacs) ]] && bind -x '"\C-g": __shellcue_suggest'

if [[ -z "$PROMPT_COMMAND" ]]; then
    PROMPT_COMMAND="__shellcue"
elif [[ "$PROMPT_COMMAND" != *"__shellcue"* ]]; then
    PROMPT_COMMAND="$PROMPT_COMMAND; __shellcue";
fi
"#;

    println!(
        "{}",
        cmd.replace("@SHELLCUE_EXE@", &current_exe)
            .replace(
                "@SHELLCUE_SOCKET@",
                &config.daemon.socket_path.display().to_string()
            )
            .replace("@SHELLCUE_HOSTNAME@", &*crate::MYHOSTNAME)
    );

    Ok(())
}
