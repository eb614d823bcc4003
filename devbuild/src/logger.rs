use std::{
    fs::{self, OpenOptions},
    io::{self, Write},
    path::PathBuf,
    sync::{Arc, Mutex},
};

use crate::{error::Result, services::LoggerFactory};

/// Cloneable handle to a project's build log. Clones write to the same sink,
/// so relays and the pipeline can interleave whole lines.
#[derive(Clone)]
pub struct ProjectLogger {
    sink: Arc<Mutex<Box<dyn Write + Send>>>,
}

impl ProjectLogger {
    pub fn new<W: Write + Send + 'static>(sink: W) -> ProjectLogger {
        ProjectLogger {
            sink: Arc::new(Mutex::new(Box::new(sink))),
        }
    }

    pub fn line(&self, line: &str) -> io::Result<()> {
        let mut sink = self.lock()?;
        sink.write_all(line.as_bytes())?;
        sink.write_all(b"\n")?;
        sink.flush()
    }

    fn lock(&self) -> io::Result<std::sync::MutexGuard<'_, Box<dyn Write + Send>>> {
        self.sink
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "project log sink poisoned"))
    }
}

impl Write for ProjectLogger {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.lock()?.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.lock()?.flush()
    }
}

struct Tee<A, B>(A, B);

impl<A: Write, B: Write> Write for Tee<A, B> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.write_all(buf)?;
        self.1.write_all(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.0.flush()?;
        self.1.flush()
    }
}

/// Appends each project's output to `<root>/<workspace>/<project>.log`.
pub struct FileLoggerFactory {
    root: PathBuf,
    echo: bool,
}

impl FileLoggerFactory {
    pub fn new(root: PathBuf, echo: bool) -> FileLoggerFactory {
        FileLoggerFactory { root, echo }
    }
}

impl LoggerFactory for FileLoggerFactory {
    fn project_logger(&self, workspace_id: &str, project_name: &str) -> Result<ProjectLogger> {
        let dir = self.root.join(workspace_id);
        fs::create_dir_all(&dir)?;

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join(format!("{}.log", project_name)))?;

        if self.echo {
            Ok(ProjectLogger::new(Tee(file, io::stdout())))
        } else {
            Ok(ProjectLogger::new(file))
        }
    }
}
