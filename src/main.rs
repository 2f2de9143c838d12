use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::{Level, info};
use tracing_subscriber::FmtSubscriber;

use espbridge::{EmailConfig, EmailMessage, create_mailer};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Global options that apply to all commands
    #[arg(short, long, default_value = "email.toml", global = true)]
    config: PathBuf,

    #[arg(short, long, default_value = "info", global = true)]
    log_level: String,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Send a single message through the configured provider
    Send {
        /// Recipient address (repeat for several)
        #[arg(short, long, required = true)]
        to: Vec<String>,

        /// Sender address; falls back to the configured default
        #[arg(short, long)]
        from: Option<String>,

        #[arg(short, long)]
        subject: String,

        #[arg(short, long)]
        body: String,

        /// Send the body as HTML instead of plain text
        #[arg(long)]
        html: bool,
    },

    /// Validate the configuration file and print the resolved settings
    Check,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Set up logging first
    let level = match cli.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = EmailConfig::load_from_file(&cli.config).await?;

    match cli.command {
        Commands::Send {
            to,
            from,
            subject,
            body,
            html,
        } => {
            let mut message = EmailMessage {
                to: to.into_iter().map(Into::into).collect(),
                from_email: from.map(Into::into),
                subject: Some(subject.into()),
                ..Default::default()
            };
            message = if html {
                message.with_html(body)
            } else {
                message.with_text(body)
            };

            let mut mailer = create_mailer(&config)?;
            let mut messages = vec![message];
            let sent = mailer.send_messages(&mut messages).await?;

            match messages[0].status() {
                Some(status) if sent > 0 => {
                    for (email, recipient) in &status.recipients {
                        println!(
                            "{}: {} ({})",
                            email,
                            recipient.status,
                            recipient.message_id.as_deref().unwrap_or("no message id")
                        );
                    }
                }
                _ => println!("Message was not sent"),
            }
        }
        Commands::Check => {
            let mailer = create_mailer(&config)?;
            let options = config.session_options(mailer.esp_name())?;
            info!("Configuration at {} is valid", cli.config.display());
            println!("Provider: {}", mailer.esp_name());
            println!("Time zone: {}", options.time_zone);
            println!("Default charset: {}", options.default_charset);
            println!("Fail silently: {}", options.fail_silently);
            println!(
                "Ignore unsupported features: {}",
                options.ignore_unsupported_features
            );
            println!("Ignore recipient status: {}", options.ignore_recipient_status);
        }
    }

    Ok(())
}
