use std::fmt;
use std::str::FromStr;

/// Startup configuration shared by the server and every session
#[derive(Debug, Clone)]
pub struct Config {
    /// port the server listens on
    pub port: u16,
    /// when set, this instance is a replica of the given master
    pub replicaof: Option<MasterAddr>,
    /// directory the startup snapshot is looked up in
    pub dir: String,
    /// file name of the startup snapshot
    pub dbfilename: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 6379,
            replicaof: None,
            dir: String::from("./"),
            dbfilename: String::from("dump.rdb"),
        }
    }
}

impl Config {
    /// path of the startup snapshot file
    pub fn snapshot_path(&self) -> String {
        if self.dir.is_empty() {
            self.dbfilename.clone()
        } else {
            format!("{}/{}", self.dir.trim_end_matches('/'), self.dbfilename)
        }
    }
}

/// Address of the master this instance replicates, parsed from
/// `--replicaof "<host> <port>"` or `--replicaof <host> <port>`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MasterAddr {
    /// master host name or address
    pub host: String,
    /// master port
    pub port: u16,
}

impl MasterAddr {
    /// join the values a `--replicaof` flag received into one address;
    /// the flag may arrive as one quoted "host port" token or as two
    pub fn from_flag_values(values: &[String]) -> Result<Self, String> {
        let joined = values.join(" ");
        joined.parse()
    }
}

impl FromStr for MasterAddr {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut words = s.split_whitespace();
        let host = words
            .next()
            .ok_or_else(|| String::from("replicaof requires a host and a port"))?;
        let port = words
            .next()
            .ok_or_else(|| String::from("replicaof requires a port"))?;
        if words.next().is_some() {
            return Err(String::from("replicaof takes exactly host and port"));
        }
        let port = port
            .parse::<u16>()
            .map_err(|_| format!("invalid replicaof port: {}", port))?;
        Ok(Self {
            host: host.to_string(),
            port,
        })
    }
}

impl fmt::Display for MasterAddr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} {}", self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replicaof_accepts_one_quoted_value() {
        let addr = MasterAddr::from_flag_values(&[String::from("localhost 6379")]).unwrap();
        assert_eq!(addr, "localhost 6379".parse().unwrap());
    }

    #[test]
    fn replicaof_accepts_two_values() {
        let values = vec![String::from("10.0.0.2"), String::from("7000")];
        let addr = MasterAddr::from_flag_values(&values).unwrap();
        assert_eq!(addr.host, "10.0.0.2");
        assert_eq!(addr.port, 7000);
    }

    #[test]
    fn replicaof_rejects_missing_or_bad_port() {
        assert!(MasterAddr::from_flag_values(&[String::from("hostonly")]).is_err());
        assert!(MasterAddr::from_flag_values(&[String::from("host notaport")]).is_err());
    }

    #[test]
    fn snapshot_path_joins_dir_and_filename() {
        let config = Config::default();
        assert_eq!(config.snapshot_path(), "./dump.rdb");

        let config = Config {
            dir: String::from("/var/data/"),
            ..Config::default()
        };
        assert_eq!(config.snapshot_path(), "/var/data/dump.rdb");
    }
}
