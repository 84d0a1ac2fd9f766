use std::{
    cell::RefCell,
    collections::{BTreeSet, HashSet},
    fs,
    path::{Path, PathBuf},
    rc::Rc,
};

use anyhow::{Context, Result, anyhow};
use clap::{Args, Parser, Subcommand, ValueEnum};
use post::core::HeadingDescriptor;
use post::editor::{EditRequest, EditSurface};
use post::{
    Command, Editor, FsPostRepository, PostConfig, PostRepository, SurfaceRegistry, WalkerKind,
    compact_toc, extract_headings, render_post,
};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(
    name = "post",
    about = "Blog post content tooling: heading TOCs and embed blocks",
    version
)]
struct Cli {
    /// Enable verbose logging for debugging.
    #[arg(long, global = true)]
    verbose: bool,
    /// Config file. Falls back to $POST_CONFIG, then ./post.toml.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Print the table of contents of HTML files.
    Toc(TocArgs),

    /// Add ids to every h2/h3 that lacks one.
    Annotate(AnnotateArgs),

    /// Inspect and edit embed blocks in stored post content.
    #[command(subcommand)]
    Embed(EmbedCommand),

    /// Work with posts in the configured posts directory.
    #[command(subcommand)]
    Posts(PostsCommand),
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum WalkerArg {
    Dom,
    Pattern,
}

impl From<WalkerArg> for WalkerKind {
    fn from(arg: WalkerArg) -> Self {
        match arg {
            WalkerArg::Dom => WalkerKind::Dom,
            WalkerArg::Pattern => WalkerKind::Pattern,
        }
    }
}

#[derive(Debug, Args)]
struct TocArgs {
    /// HTML files or directories containing HTML files.
    #[arg(required = true)]
    inputs: Vec<PathBuf>,
    /// Emit JSON instead of an indented list.
    #[arg(long)]
    json: bool,
    /// Heading walker. Defaults to the configured one.
    #[arg(long, value_enum)]
    walker: Option<WalkerArg>,
    /// Only show the first N headings.
    #[arg(long)]
    limit: Option<usize>,
}

#[derive(Debug, Args)]
struct AnnotateArgs {
    /// HTML files or directories containing HTML files.
    #[arg(required = true)]
    inputs: Vec<PathBuf>,
    /// Overwrite the file instead of printing to stdout.
    #[arg(long)]
    in_place: bool,
    #[arg(long, value_enum)]
    walker: Option<WalkerArg>,
}

#[derive(Debug, Args)]
#[group(required = true, multiple = false)]
struct ContentArgs {
    /// Raw HTML fragment for the embed.
    #[arg(long)]
    content: Option<String>,
    /// Read the fragment from a file.
    #[arg(long)]
    content_file: Option<PathBuf>,
}

impl ContentArgs {
    fn read(&self) -> Result<String> {
        match (&self.content, &self.content_file) {
            (Some(content), _) => Ok(content.clone()),
            (None, Some(path)) => {
                fs::read_to_string(path).with_context(|| format!("reading {:?}", path))
            }
            (None, None) => Err(anyhow!("either --content or --content-file is required")),
        }
    }
}

#[derive(Debug, Subcommand)]
enum EmbedCommand {
    /// List embed blocks with their positions.
    List {
        file: PathBuf,
        #[arg(long)]
        json: bool,
    },
    /// Insert a new embed block.
    Insert {
        file: PathBuf,
        /// Node boundary to insert at. Defaults to the end of the document.
        #[arg(long)]
        at: Option<usize>,
        #[command(flatten)]
        content: ContentArgs,
        #[arg(long)]
        in_place: bool,
    },
    /// Replace the content of the embed at INDEX (0-based, document order).
    Edit {
        file: PathBuf,
        index: usize,
        #[command(flatten)]
        content: ContentArgs,
        #[arg(long)]
        in_place: bool,
    },
    /// Delete the embed at INDEX.
    Delete {
        file: PathBuf,
        index: usize,
        #[arg(long)]
        in_place: bool,
    },
}

#[derive(Debug, Subcommand)]
enum PostsCommand {
    /// List posts, newest first.
    List {
        /// Include drafts.
        #[arg(long)]
        all: bool,
        #[arg(long)]
        json: bool,
    },
    /// Render a post as its public page payload.
    Render {
        slug: String,
        /// Locale to render. Defaults to the configured default locale.
        #[arg(long)]
        locale: Option<String>,
        #[arg(long)]
        json: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    let config = PostConfig::load(cli.config.as_deref())?;
    match cli.command {
        Commands::Toc(args) => handle_toc(args, &config),
        Commands::Annotate(args) => handle_annotate(args, &config),
        Commands::Embed(command) => handle_embed(command),
        Commands::Posts(command) => handle_posts(command, &config),
    }
}

/// `RUST_LOG` wins; otherwise `--verbose` selects debug output.
fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

fn handle_toc(args: TocArgs, config: &PostConfig) -> Result<()> {
    let TocArgs {
        inputs,
        json,
        walker,
        limit,
    } = args;
    let expanded = expand_inputs(&inputs)?;
    if expanded.is_empty() {
        anyhow::bail!("no HTML files found in the provided inputs");
    }

    let kind = walker.map(WalkerKind::from).unwrap_or(config.toc.walker);
    let walker = kind.walker();
    let mut tocs = Vec::new();
    for path in expanded {
        let html = fs::read_to_string(&path).with_context(|| format!("reading {:?}", path))?;
        let toc = extract_headings(&html, walker.as_ref());
        let headings = match limit {
            Some(limit) => compact_toc(&toc.headings, limit).to_vec(),
            None => toc.headings,
        };
        tocs.push((path, headings));
    }

    if json {
        #[derive(serde::Serialize)]
        struct JsonOutput<'a> {
            path: String,
            headings: &'a [HeadingDescriptor],
        }

        let payload: Vec<JsonOutput<'_>> = tocs
            .iter()
            .map(|(path, headings)| JsonOutput {
                path: path.display().to_string(),
                headings,
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&payload)?);
    } else {
        for (idx, (path, headings)) in tocs.iter().enumerate() {
            if tocs.len() > 1 {
                println!("== {} ==", path.display());
            }
            print!("{}", format_toc(headings));
            if tocs.len() > 1 && idx + 1 < tocs.len() {
                println!();
            }
        }
    }
    Ok(())
}

fn handle_annotate(args: AnnotateArgs, config: &PostConfig) -> Result<()> {
    let AnnotateArgs {
        inputs,
        in_place,
        walker,
    } = args;
    let expanded = expand_inputs(&inputs)?;
    if expanded.is_empty() {
        anyhow::bail!("no HTML files found in the provided inputs");
    }

    let walker = walker.map(WalkerKind::from).unwrap_or(config.toc.walker).walker();
    let mut annotated = Vec::new();
    for path in expanded {
        let html = fs::read_to_string(&path).with_context(|| format!("reading {:?}", path))?;
        let toc = extract_headings(&html, walker.as_ref());
        if in_place {
            if toc.content != html {
                fs::write(&path, toc.content.as_bytes())
                    .with_context(|| format!("writing {:?}", path))?;
                info!(path = %path.display(), headings = toc.headings.len(), "annotated");
            }
        } else {
            annotated.push((path, toc.content));
        }
    }
    print!("{}", format_annotated(&annotated));
    Ok(())
}

/// Annotated files for stdout, each under an `== path ==` header when there are several.
fn format_annotated(files: &[(PathBuf, String)]) -> String {
    let mut out = String::new();
    for (path, content) in files {
        if files.len() > 1 {
            out.push_str(&format!("== {} ==\n", path.display()));
        }
        out.push_str(content);
        if !content.ends_with('\n') {
            out.push('\n');
        }
    }
    out
}

fn handle_embed(command: EmbedCommand) -> Result<()> {
    match command {
        EmbedCommand::List { file, json } => {
            let html = read_html(&file)?;
            let editor = Editor::from_html(&html);
            let embeds: Vec<EmbedListing> = editor
                .document()
                .embeds()
                .enumerate()
                .map(|(index, (pos, embed))| EmbedListing {
                    index,
                    pos,
                    content: embed.content.clone(),
                })
                .collect();
            if json {
                println!("{}", serde_json::to_string_pretty(&embeds)?);
            } else if embeds.is_empty() {
                eprintln!("No embed blocks in {}.", file.display());
            } else {
                for embed in embeds {
                    println!("{:>3} @{:<6} {}", embed.index, embed.pos, preview(&embed.content));
                }
            }
            Ok(())
        }
        EmbedCommand::Insert {
            file,
            at,
            content,
            in_place,
        } => {
            let updated = insert_embed(&read_html(&file)?, at, &content.read()?)?;
            write_output(&file, &updated, in_place)
        }
        EmbedCommand::Edit {
            file,
            index,
            content,
            in_place,
        } => {
            let updated = edit_embed(&read_html(&file)?, index, &content.read()?)?;
            write_output(&file, &updated, in_place)
        }
        EmbedCommand::Delete {
            file,
            index,
            in_place,
        } => {
            let updated = delete_embed(&read_html(&file)?, index)?;
            write_output(&file, &updated, in_place)
        }
    }
}

fn handle_posts(command: PostsCommand, config: &PostConfig) -> Result<()> {
    let repo = FsPostRepository::new(&config.content.posts_dir);
    let fallback = config.content.default_locale.as_str();
    match command {
        PostsCommand::List { all, json } => {
            let mut posts = repo.list()?;
            if !all {
                posts.retain(|post| post.is_published());
            }
            if json {
                println!("{}", serde_json::to_string_pretty(&posts)?);
                return Ok(());
            }
            if posts.is_empty() {
                eprintln!("No posts found in {}.", repo.root().display());
                return Ok(());
            }
            for post in posts {
                let date = post
                    .published_at
                    .map(|at| at.format("%Y-%m-%d").to_string())
                    .unwrap_or_else(|| "-".to_string());
                let status = if post.is_published() { "published" } else { "draft" };
                let title = post
                    .title
                    .resolve(fallback, fallback)
                    .map(|(_, title)| title)
                    .unwrap_or("");
                println!("{:<10} {:<9} {:<32} {}", date, status, post.slug, title);
            }
            Ok(())
        }
        PostsCommand::Render { slug, locale, json } => {
            let post = repo
                .load(&slug)?
                .ok_or_else(|| anyhow!("no post {slug:?} in {}", repo.root().display()))?;
            let locale = locale.unwrap_or_else(|| fallback.to_string());
            let rendered = render_post(&post, &locale, fallback, &config.render_options());
            if json {
                println!("{}", serde_json::to_string_pretty(&rendered)?);
            } else {
                println!("# {}", rendered.title);
                print!("{}", format_toc(&rendered.toc));
                println!();
                println!("{}", rendered.html);
            }
            Ok(())
        }
    }
}

#[derive(Debug, serde::Serialize)]
struct EmbedListing {
    index: usize,
    pos: usize,
    content: String,
}

/// Stages edit requests so a non-interactive caller can confirm them.
#[derive(Clone, Default)]
struct StagedSurface(Rc<RefCell<Option<EditRequest>>>);

impl EditSurface for StagedSurface {
    fn open(&mut self, request: EditRequest) {
        *self.0.borrow_mut() = Some(request);
    }
}

fn insert_embed(html: &str, at: Option<usize>, content: &str) -> Result<String> {
    let mut editor = Editor::from_html(html);
    let at = at.unwrap_or_else(|| editor.document().len());
    editor.dispatch(Command::InsertEmbed {
        at,
        content: content.to_string(),
    })?;
    Ok(editor.to_html())
}

fn edit_embed(html: &str, index: usize, content: &str) -> Result<String> {
    let mut editor = Editor::from_html(html);
    let mut registry = SurfaceRegistry::new();
    let staged = StagedSurface::default();
    editor.mount(&mut registry, Box::new(staged.clone()));

    let view = nth_view(&editor, index)?;
    if !view.click_edit(&editor, &mut registry) {
        anyhow::bail!("embed {index} could not be opened for editing");
    }
    let request = staged
        .0
        .borrow_mut()
        .take()
        .ok_or_else(|| anyhow!("edit surface received no request"))?;
    debug!(index, pos = request.pos, "editing embed");
    editor.dispatch(request.confirm(content))?;
    editor.unmount(&mut registry);
    Ok(editor.to_html())
}

fn delete_embed(html: &str, index: usize) -> Result<String> {
    let mut editor = Editor::from_html(html);
    let view = nth_view(&editor, index)?;
    if !view.click_delete(&mut editor)? {
        anyhow::bail!("embed {index} is no longer in the document");
    }
    Ok(editor.to_html())
}

fn nth_view(editor: &Editor, index: usize) -> Result<post::EmbedView> {
    let views = editor.embed_views();
    views
        .get(index)
        .copied()
        .ok_or_else(|| anyhow!("no embed at index {index} ({} embeds)", views.len()))
}

fn format_toc(headings: &[HeadingDescriptor]) -> String {
    let mut out = String::new();
    for heading in headings {
        let indent = if heading.level > 2 { "  " } else { "" };
        out.push_str(&format!("{indent}- {} #{}\n", heading.text, heading.id));
    }
    out
}

fn preview(content: &str) -> String {
    let flat: String = content.split_whitespace().collect::<Vec<_>>().join(" ");
    if flat.chars().count() > 60 {
        let cut: String = flat.chars().take(57).collect();
        format!("{cut}...")
    } else {
        flat
    }
}

fn read_html(path: &Path) -> Result<String> {
    fs::read_to_string(path).with_context(|| format!("reading {:?}", path))
}

fn write_output(path: &Path, html: &str, in_place: bool) -> Result<()> {
    if in_place {
        fs::write(path, html.as_bytes()).with_context(|| format!("writing {:?}", path))?;
        info!(path = %path.display(), "updated");
    } else {
        print!("{html}");
        if !html.ends_with('\n') {
            println!();
        }
    }
    Ok(())
}

fn is_html(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.eq_ignore_ascii_case("html") || ext.eq_ignore_ascii_case("htm"))
        .unwrap_or(false)
}

fn expand_inputs(paths: &[PathBuf]) -> Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    let mut visited = BTreeSet::new();
    for path in paths {
        let canonical =
            fs::canonicalize(path).with_context(|| format!("resolving path {:?}", path))?;
        let meta = fs::metadata(&canonical)
            .with_context(|| format!("reading metadata for {:?}", canonical))?;
        if meta.is_dir() {
            debug!(dir = %canonical.display(), "scanning directory");
            let mut found = Vec::new();
            visit_dir(&canonical, &mut found, &mut HashSet::new())?;
            found.sort();
            for file in found {
                if visited.insert(file.clone()) {
                    out.push(file);
                }
            }
        } else if meta.is_file() {
            if !is_html(&canonical) {
                anyhow::bail!("{:?} is not an .html file", canonical);
            }
            if visited.insert(canonical.clone()) {
                out.push(canonical);
            }
        }
    }
    Ok(out)
}

fn visit_dir(path: &Path, out: &mut Vec<PathBuf>, visited: &mut HashSet<PathBuf>) -> Result<()> {
    let canonical = fs::canonicalize(path)?;
    if !visited.insert(canonical.clone()) {
        return Ok(());
    }

    let metadata = fs::metadata(&canonical)?;
    if metadata.is_dir() {
        for entry in fs::read_dir(&canonical)? {
            let entry = entry?;
            if entry.file_type()?.is_symlink() {
                continue;
            }
            visit_dir(&entry.path(), out, visited)?;
        }
    } else if metadata.is_file() && is_html(&canonical) {
        debug!(file = %canonical.display(), "found html file");
        out.push(canonical);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    const PAGE: &str = "<h2>Setup</h2>\
        <div data-type=\"embed\"><iframe src=\"https://a.example\"></iframe></div>\
        <p>between</p>\
        <div data-type=\"embed\"><iframe src=\"https://b.example\"></iframe></div>";

    #[test]
    fn insert_embed_defaults_to_the_end() {
        let updated = insert_embed("<p>a</p>", None, "<hr>").expect("insert");
        assert_eq!(updated, "<p>a</p><div data-type=\"embed\"><hr></div>");

        let err = insert_embed("<p>a</p>", Some(1), "<hr>").expect_err("inside node");
        assert!(err.to_string().contains("not a node boundary"));
    }

    #[test]
    fn edit_embed_touches_only_the_selected_block() {
        let updated = edit_embed(PAGE, 1, "<video></video>").expect("edit");
        assert_eq!(
            updated,
            "<h2>Setup</h2>\
             <div data-type=\"embed\"><iframe src=\"https://a.example\"></iframe></div>\
             <p>between</p>\
             <div data-type=\"embed\"><video></video></div>"
        );
    }

    #[test]
    fn delete_embed_removes_the_selected_block() {
        let updated = delete_embed(PAGE, 0).expect("delete");
        assert!(!updated.contains("a.example"));
        assert!(updated.contains("b.example"));
        assert!(updated.starts_with("<h2>Setup</h2><p>between</p>"));
    }

    #[test]
    fn out_of_range_index_is_reported() {
        let err = edit_embed(PAGE, 5, "x").expect_err("no such embed");
        assert_eq!(err.to_string(), "no embed at index 5 (2 embeds)");
        assert!(delete_embed("<p>none</p>", 0).is_err());
    }

    #[test]
    fn format_toc_indents_subheadings() {
        let headings = vec![
            HeadingDescriptor {
                id: "heading-0".into(),
                text: "Intro".into(),
                level: 2,
            },
            HeadingDescriptor {
                id: "details".into(),
                text: "Details".into(),
                level: 3,
            },
        ];
        assert_eq!(format_toc(&headings), "- Intro #heading-0\n  - Details #details\n");
    }

    #[test]
    fn annotating_a_directory_separates_each_file() {
        let tmp = tempfile::tempdir().expect("tempdir");
        fs::write(tmp.path().join("a.html"), "<h2>A</h2>").expect("write a");
        fs::write(tmp.path().join("b.html"), "<h2>B</h2>\n").expect("write b");

        let files = expand_inputs(&[tmp.path().to_path_buf()]).expect("expand");
        let walker = WalkerKind::Dom.walker();
        let annotated: Vec<_> = files
            .into_iter()
            .map(|path| {
                let html = fs::read_to_string(&path).expect("read");
                (path, extract_headings(&html, walker.as_ref()).content)
            })
            .collect();

        let out = format_annotated(&annotated);
        let headers: Vec<_> = out.lines().filter(|l| l.starts_with("== ")).collect();
        assert_eq!(headers.len(), 2);
        assert!(headers[0].ends_with("a.html =="));
        assert!(out.contains("a.html ==\n<h2 id=\"heading-0\">A</h2>\n== "));
        assert!(out.ends_with("b.html ==\n<h2 id=\"heading-0\">B</h2>\n"));

        let single = format_annotated(&annotated[..1]);
        assert!(!single.contains("=="));
        assert_eq!(single, "<h2 id=\"heading-0\">A</h2>\n");
    }

    #[test]
    fn preview_flattens_and_truncates() {
        assert_eq!(preview("<div>\n  <p>x</p>\n</div>"), "<div> <p>x</p> </div>");
        let long = "x".repeat(80);
        let shown = preview(&long);
        assert_eq!(shown.len(), 60);
        assert!(shown.ends_with("..."));
    }

    #[test]
    fn expand_inputs_collects_html_files_from_directories() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let root = tmp.path();
        fs::create_dir_all(root.join("nested")).expect("mkdir nested");
        fs::write(root.join("b.html"), "<h2>B</h2>").expect("write b");
        fs::write(root.join("nested/a.HTM"), "<h2>A</h2>").expect("write a");
        fs::write(root.join("notes.md"), "# skip").expect("write md");

        let files = expand_inputs(&[root.to_path_buf(), root.join("b.html")]).expect("expand");
        let names: Vec<_> = files
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, ["b.html", "a.HTM"]);

        let err = expand_inputs(&[root.join("notes.md")]).expect_err("not html");
        assert!(err.to_string().contains("is not an .html file"));
    }

    #[test]
    fn content_args_prefer_inline_then_file() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let path = tmp.path().join("snippet.html");
        fs::write(&path, "<iframe></iframe>").expect("write snippet");

        let from_file = ContentArgs {
            content: None,
            content_file: Some(path),
        };
        assert_eq!(from_file.read().expect("read"), "<iframe></iframe>");

        let inline = ContentArgs {
            content: Some("<hr>".into()),
            content_file: None,
        };
        assert_eq!(inline.read().expect("read"), "<hr>");
    }
}
