use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Interpreter environment activated before a python program starts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PythonEnv {
    /// Named conda environment under a conda installation root
    Conda { root: String, name: String },
    /// Plain virtualenv directory
    Venv { path: String },
    /// Whatever `python` resolves to on PATH
    System,
}

impl PythonEnv {
    pub fn conda(root: &str, name: &str) -> PythonEnv {
        PythonEnv::Conda {
            root: root.to_owned(),
            name: name.to_owned(),
        }
    }

    /// Directory whose `bin` holds the interpreter
    pub fn prefix(&self, home: Option<&Path>) -> Option<PathBuf> {
        match self {
            PythonEnv::Conda { root, name } => {
                let root = expand_home(root, home);
                if name == "base" {
                    Some(root)
                } else {
                    Some(root.join("envs").join(name))
                }
            }
            PythonEnv::Venv { path } => Some(expand_home(path, home)),
            PythonEnv::System => None,
        }
    }

    /// Environment variables equivalent to sourcing the activate script
    pub fn activation_vars(&self, home: Option<&Path>, base_path: &str) -> Vec<(String, String)> {
        let prefix = match self.prefix(home) {
            Some(prefix) => prefix,
            None => return vec![],
        };
        let bin = prefix.join("bin");
        let path = if base_path.is_empty() {
            bin.display().to_string()
        } else {
            format!("{}:{}", bin.display(), base_path)
        };
        let mut vars = vec![("PATH".to_owned(), path)];
        match self {
            PythonEnv::Conda { name, .. } => {
                vars.push(("CONDA_PREFIX".to_owned(), prefix.display().to_string()));
                vars.push(("CONDA_DEFAULT_ENV".to_owned(), name.clone()));
            }
            PythonEnv::Venv { .. } => {
                vars.push(("VIRTUAL_ENV".to_owned(), prefix.display().to_string()));
            }
            PythonEnv::System => {}
        }
        vars
    }

    /// `source ...` step used when the program runs through a remote shell
    pub fn activate_line(&self) -> Option<String> {
        match self {
            PythonEnv::Conda { root, name } => Some(format!(
                "source {}/bin/activate {}",
                quote(root.trim_end_matches('/')),
                quote(name)
            )),
            PythonEnv::Venv { path } => Some(format!(
                "source {}/bin/activate",
                quote(path.trim_end_matches('/'))
            )),
            PythonEnv::System => None,
        }
    }
}

/// One fully resolved python program launch
#[derive(Debug, Clone, PartialEq)]
pub struct Invocation {
    pub python: PythonEnv,
    pub working_dir: PathBuf,
    pub program: String,
    pub args: Vec<String>,
}

impl Invocation {
    pub fn new(
        python: PythonEnv,
        working_dir: PathBuf,
        program: &str,
        args: Vec<String>,
    ) -> Invocation {
        Invocation {
            python,
            working_dir,
            program: program.to_owned(),
            args,
        }
    }

    pub fn argv(&self) -> Vec<String> {
        let mut argv = Vec::with_capacity(self.args.len() + 2);
        argv.push("python".to_owned());
        argv.push(self.program.clone());
        argv.extend(self.args.iter().cloned());
        argv
    }

    /// The python command alone, as it would be typed in the working directory
    pub fn command_line(&self) -> String {
        join_quoted(&self.argv())
    }

    pub fn env_overrides(&self, home: Option<&Path>, base_path: &str) -> Vec<(String, String)> {
        self.python.activation_vars(home, base_path)
    }

    /// Activation, directory change and program in one line for `bash -c` or ssh
    pub fn shell_line(&self) -> String {
        let mut steps = vec![];
        if let Some(activate) = self.python.activate_line() {
            steps.push(activate);
        }
        steps.push(format!("cd {}", quote(&self.working_dir.display().to_string())));
        steps.push(self.command_line());
        steps.join(" && ")
    }
}

/// What a profile ends up executing
#[derive(Debug, Clone, PartialEq)]
pub enum Launch {
    Python(Invocation),
    /// Raw command line, split on whitespace when run locally
    Script {
        command: String,
        working_dir: Option<PathBuf>,
    },
}

impl Launch {
    pub fn describe(&self) -> String {
        match self {
            Launch::Python(invocation) => invocation.shell_line(),
            Launch::Script { command, .. } => command.clone(),
        }
    }
}

fn is_safe_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || "-_./=:,+@%~".contains(c)
}

/// POSIX shell quoting, words made only of safe characters stay bare
pub fn quote(word: &str) -> String {
    if !word.is_empty() && word.chars().all(is_safe_char) {
        return word.to_owned();
    }
    format!("'{}'", word.replace('\'', r#"'"'"'"#))
}

pub fn join_quoted(words: &[String]) -> String {
    words
        .iter()
        .map(|word| quote(word))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Replaces a leading `~` with the home directory when one is known
pub fn expand_home(path: &str, home: Option<&Path>) -> PathBuf {
    match (path.strip_prefix('~'), home) {
        (Some(""), Some(home)) => home.to_path_buf(),
        (Some(rest), Some(home)) if rest.starts_with('/') => {
            home.join(rest.trim_start_matches('/'))
        }
        _ => PathBuf::from(path),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn home() -> Option<&'static Path> {
        Some(Path::new("/home/pilot"))
    }

    #[test]
    fn quote_leaves_plain_words_bare() {
        assert_eq!(quote("--redis_ip"), "--redis_ip");
        assert_eq!(quote("192.168.123.164"), "192.168.123.164");
        assert_eq!(quote("~/miniconda3"), "~/miniconda3");
    }

    #[test]
    fn quote_wraps_special_words() {
        assert_eq!(quote(""), "''");
        assert_eq!(quote("two words"), "'two words'");
        assert_eq!(quote("it's"), r#"'it'"'"'s'"#);
        assert_eq!(quote("$HOME"), "'$HOME'");
    }

    #[test]
    fn expand_home_only_touches_leading_tilde() {
        assert_eq!(
            expand_home("~/miniconda3", home()),
            PathBuf::from("/home/pilot/miniconda3")
        );
        assert_eq!(expand_home("~", home()), PathBuf::from("/home/pilot"));
        assert_eq!(expand_home("/opt/conda", home()), PathBuf::from("/opt/conda"));
        assert_eq!(expand_home("~other/x", home()), PathBuf::from("~other/x"));
        assert_eq!(expand_home("~/x", None), PathBuf::from("~/x"));
    }

    #[test]
    fn conda_activation_prefixes_path() {
        let env = PythonEnv::conda("~/miniconda3", "twist2");
        let vars = env.activation_vars(home(), "/usr/bin:/bin");
        assert_eq!(
            vars,
            vec![
                (
                    "PATH".to_owned(),
                    "/home/pilot/miniconda3/envs/twist2/bin:/usr/bin:/bin".to_owned()
                ),
                (
                    "CONDA_PREFIX".to_owned(),
                    "/home/pilot/miniconda3/envs/twist2".to_owned()
                ),
                ("CONDA_DEFAULT_ENV".to_owned(), "twist2".to_owned()),
            ]
        );
    }

    #[test]
    fn conda_base_uses_root() {
        let env = PythonEnv::conda("/opt/conda", "base");
        assert_eq!(env.prefix(None), Some(PathBuf::from("/opt/conda")));
    }

    #[test]
    fn venv_activation() {
        let env = PythonEnv::Venv {
            path: "/srv/venv".to_owned(),
        };
        let vars = env.activation_vars(None, "");
        assert_eq!(vars[0], ("PATH".to_owned(), "/srv/venv/bin".to_owned()));
        assert_eq!(vars[1], ("VIRTUAL_ENV".to_owned(), "/srv/venv".to_owned()));
        assert_eq!(
            env.activate_line().unwrap(),
            "source /srv/venv/bin/activate"
        );
    }

    #[test]
    fn system_env_has_no_activation() {
        assert!(PythonEnv::System.activation_vars(home(), "/bin").is_empty());
        assert!(PythonEnv::System.activate_line().is_none());
    }

    #[test]
    fn shell_line_chains_steps() {
        let invocation = Invocation::new(
            PythonEnv::conda("~/miniconda3/", "gmr"),
            PathBuf::from("/work/deploy_real"),
            "script.py",
            vec!["--name".to_owned(), "a b".to_owned()],
        );
        assert_eq!(
            invocation.shell_line(),
            "source ~/miniconda3/bin/activate gmr && cd /work/deploy_real && python script.py --name 'a b'"
        );
        assert_eq!(invocation.argv()[0], "python");
        assert_eq!(invocation.argv().len(), 4);
    }
}
